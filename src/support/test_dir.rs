use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::support::run::new_task_id;

/// Scratch directory removed on drop.
pub(crate) struct TestDir {
    path: PathBuf,
}

impl TestDir {
    pub(crate) fn new(label: &str) -> Self {
        let path = env::temp_dir().join(format!("relaykeeper-{label}-{}", new_task_id()));
        fs::create_dir_all(&path).expect("create test dir");
        Self { path }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}
