//! Discovery and loading of test definition files.

use crate::model::TestDefinition;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Directories searched when no path is given, in order. The first
/// one that exists wins.
pub const DEFAULT_TEST_DIRS: [&str; 3] = ["tests/steps", "test/steps", "."];

/// Loads test definitions from files and directories.
#[derive(Debug, Default)]
pub struct TestLoader {
    pub test_paths: Vec<PathBuf>,
}

impl TestLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader over the first existing default directory.
    pub fn discover() -> Self {
        let mut loader = Self::new();
        if let Some(dir) = DEFAULT_TEST_DIRS.iter().map(Path::new).find(|p| p.is_dir()) {
            debug!("Using test directory {}", dir.display());
            loader.add_path(dir);
        }
        loader
    }

    pub fn add_path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.test_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Load a single test file. `.json` files are parsed as JSON,
    /// everything else as YAML.
    pub fn load_test<P: AsRef<Path>>(&self, path: P) -> Result<TestDefinition> {
        let path = path.as_ref();
        info!("Loading test from {}", path.display());

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read test file: {}", path.display()))?;

        let test = if path.extension().is_some_and(|ext| ext == "json") {
            TestDefinition::from_json(&content)
                .with_context(|| format!("Failed to parse JSON from {}", path.display()))?
        } else {
            TestDefinition::from_yaml(&content)
                .with_context(|| format!("Failed to parse YAML from {}", path.display()))?
        };

        debug!("Loaded test '{}' with {} step(s)", test.name, test.steps.len());
        Ok(test)
    }

    /// Load every test file directly inside `dir`, sorted by file
    /// name. Files that fail to parse are skipped with a warning.
    pub fn load_tests_from_dir<P: AsRef<Path>>(&self, dir: P) -> Result<Vec<TestDefinition>> {
        let dir = dir.as_ref();
        info!("Loading tests from directory: {}", dir.display());

        let mut paths = Vec::new();
        for entry in fs::read_dir(dir)
            .with_context(|| format!("Failed to read directory: {}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_file() && is_test_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut tests = Vec::with_capacity(paths.len());
        for path in paths {
            match self.load_test(&path) {
                Ok(test) => tests.push(test),
                Err(err) => warn!("Skipping {}: {err:#}", path.display()),
            }
        }

        info!("Loaded {} tests from {}", tests.len(), dir.display());
        Ok(tests)
    }

    /// Load every configured path. Files are loaded directly and
    /// errors on them are returned; directories are scanned.
    pub fn load_all_tests(&self) -> Result<Vec<TestDefinition>> {
        let mut all_tests = Vec::new();

        for path in &self.test_paths {
            if path.is_file() {
                all_tests.push(self.load_test(path)?);
            } else if path.is_dir() {
                all_tests.append(&mut self.load_tests_from_dir(path)?);
            } else {
                warn!("Test path {} does not exist", path.display());
            }
        }

        info!("Loaded {} tests in total", all_tests.len());
        Ok(all_tests)
    }
}

/// Return `true` for `.yaml`, `.yml` and `.json` files.
fn is_test_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == "yaml" || ext == "yml" || ext == "json")
}
