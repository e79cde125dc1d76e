use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::info;

use crate::user::User;

/// Process-wide table of users, keyed by login identifier.
///
/// Users are created on first reference and never evicted.
pub struct UserRegistry {
    users: DashMap<String, Arc<User>>,
    storage_root: PathBuf,
    flood_threshold: Duration,
}

impl UserRegistry {
    pub fn new(storage_root: impl Into<PathBuf>, flood_threshold: Duration) -> Self {
        Self {
            users: DashMap::new(),
            storage_root: storage_root.into(),
            flood_threshold,
        }
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    /// Concurrent callers with the same id always receive the same `User`.
    pub fn get_or_create(&self, id: &str) -> Arc<User> {
        if let Some(user) = self.users.get(id) {
            return Arc::clone(user.value());
        }
        let entry = self.users.entry(id.to_string()).or_insert_with(|| {
            info!(user = %id, "user created");
            Arc::new(User::new(id, &self.storage_root, self.flood_threshold))
        });
        Arc::clone(entry.value())
    }

    pub fn get(&self, id: &str) -> Option<Arc<User>> {
        self.users.get(id).map(|u| Arc::clone(u.value()))
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
