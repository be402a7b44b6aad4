// Copyright 2025 Anapaya Systems
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! Synchronous JSON file I/O helpers.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Serialize, de::DeserializeOwned};

/// Reads a file and deserializes its JSON content into the specified type.
pub fn read_json<P, T>(path: P) -> std::io::Result<T>
where
    P: AsRef<Path>,
    T: DeserializeOwned,
{
    let buf = fs::read(path.as_ref())?;
    serde_json::from_slice(&buf).map_err(std::io::Error::other)
}

/// Serializes the given value to JSON and atomically replaces the file at
/// `path`.
///
/// The payload lands in a sibling temp file first and is renamed over the
/// target, so a reader never observes a partially written file.
pub fn write_json_atomic(path: impl AsRef<Path>, content: &impl Serialize) -> std::io::Result<()> {
    let path = path.as_ref();
    let buf = serde_json::to_vec(content).map_err(std::io::Error::other)?;
    let tmp = tmp_sibling(path);
    fs::write(&tmp, &buf)?;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    Ok(())
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Returns a temporary path in the system's temp directory, prefixed with the
/// current thread name.
pub fn get_tmp_path<S: AsRef<str>>(name: S) -> PathBuf {
    let path = std::env::temp_dir();
    let current_thread = std::thread::current()
        .name()
        .unwrap_or("main")
        .replace("::", "_");
    path.join(format!("{}_{}", current_thread, name.as_ref()))
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        name: String,
        count: u32,
    }

    #[test]
    fn test_write_read_roundtrip() {
        let path = get_tmp_path("roundtrip.json");
        let payload = Payload {
            name: "pool".to_string(),
            count: 7,
        };

        write_json_atomic(&path, &payload).expect("write should succeed");
        let read: Payload = read_json(&path).expect("read should succeed");
        assert_eq!(read, payload);

        // The temp sibling must not survive a successful write.
        assert!(!tmp_sibling(&path).exists());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_read_missing_file() {
        let path = get_tmp_path("does_not_exist.json");
        let err = read_json::<_, Payload>(&path).expect_err("read should fail");
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn test_read_malformed_payload() {
        let path = get_tmp_path("malformed.json");
        fs::write(&path, b"{not json").unwrap();
        let err = read_json::<_, Payload>(&path).expect_err("read should fail");
        assert_eq!(err.kind(), std::io::ErrorKind::Other);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_write_replaces_existing_content() {
        let path = get_tmp_path("replace.json");
        write_json_atomic(
            &path,
            &Payload {
                name: "old".to_string(),
                count: 1,
            },
        )
        .unwrap();
        write_json_atomic(
            &path,
            &Payload {
                name: "new".to_string(),
                count: 2,
            },
        )
        .unwrap();

        let read: Payload = read_json(&path).unwrap();
        assert_eq!(read.name, "new");
        assert_eq!(read.count, 2);
        let _ = fs::remove_file(&path);
    }
}
