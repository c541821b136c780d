//! Helper functions for testing.

use std::fs;
use std::path::{Path, PathBuf};

use rand::Rng;
use rand::distr::Alphanumeric;
use url::Url;

use crate::commons::storage::NamespaceBuf;

/// Returns a random alphanumeric string of the given length.
pub fn random_string(length: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Returns the hex encoding of 8 random bytes.
pub fn random_hex_string() -> String {
    let mut bytes = [0; 8];
    openssl::rand::rand_bytes(&mut bytes).unwrap();
    hex::encode(bytes)
}

pub fn random_namespace() -> NamespaceBuf {
    random_string(8).parse().unwrap()
}

/// Returns a storage URI for a fresh in-memory store.
pub fn mem_storage() -> Url {
    Url::parse(&format!("memory://{}", random_hex_string())).unwrap()
}

/// Sets up a random subdirectory and returns it together with a closure
/// that removes it again.
pub fn tmp_dir() -> (PathBuf, impl FnOnce()) {
    let dir = sub_dir(&std::env::temp_dir());
    let cleanup = {
        let dir = dir.clone();
        move || {
            let _ = fs::remove_dir_all(dir);
        }
    };
    (dir, cleanup)
}

/// This method sets up a random subdirectory and returns it. It is
/// assumed that the caller will clean this directory themselves.
pub fn sub_dir(base_dir: &Path) -> PathBuf {
    let mut dir = base_dir.to_path_buf();
    dir.push(random_hex_string());

    fs::create_dir_all(&dir).unwrap();

    dir
}
