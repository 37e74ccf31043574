fn main() {
    println!("Run `cargo test -p wire-compat` to execute checkpoint compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use partwise_protocol::go_time::GO_ZERO_TIME;
    use partwise_transfer::{
        Checkpoint, CheckpointStore, DownloadCheckpoint, UploadCheckpoint, load_checkpoint,
    };

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    /// Deserializes a fixture, re-serializes it and compares the JSON values.
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));
        assert_eq!(
            fixture, reserialized,
            "roundtrip mismatch for {name}:\n  Go:   {fixture}\n  Rust: {reserialized}"
        );
        parsed
    }

    #[test]
    fn fixture_upload_checkpoint() {
        let cp: UploadCheckpoint = roundtrip_test("upload_checkpoint.json");
        assert_eq!(cp.upload_id, "2f1c7e0a9b8d4c3e");
        assert_eq!(cp.file_info.last_modified, 1_718_000_000);
        assert_eq!(cp.parts_info.len(), 3);
        assert_eq!(cp.parts_info[0].crc64, 14_581_697_426_543_300_122);
        assert!(!cp.parts_info[2].is_completed);
        assert_eq!(cp.completed_bytes(), 20 * 1024 * 1024);
        assert!(cp.has_indexed_parts());
    }

    #[test]
    fn fixture_download_checkpoint() {
        let cp: DownloadCheckpoint = roundtrip_test("download_checkpoint.json");
        assert_eq!(cp.version_id, "v42");
        assert!(cp.if_modified_since.is_some());
        assert!(cp.if_unmodified_since.is_none());
        assert_eq!(cp.object_info.object_size, 26_214_400);
        assert_eq!(cp.parts_info[2].range_end, 26_214_399);
        assert_eq!(cp.completed_bytes(), 10 * 1024 * 1024);
        assert_eq!(cp.conditions().if_match, "\"a1b2c3d4\"");
    }

    #[test]
    fn fixture_download_checkpoint_empty_object() {
        let cp: DownloadCheckpoint = roundtrip_test("download_checkpoint_empty_object.json");
        assert!(cp.parts_info.is_empty());
        assert_eq!(cp.object_info.object_size, 0);
        assert_eq!(cp.completed_bytes(), 0);
    }

    #[test]
    fn go_zero_time_written_for_unset_conditions() {
        let cp = DownloadCheckpoint {
            bucket: "b".into(),
            key: "k".into(),
            ..Default::default()
        };
        let v = serde_json::to_value(&cp).unwrap();
        assert_eq!(v["IfModifiedSince"], GO_ZERO_TIME);
        assert_eq!(v["IfUnmodifiedSince"], GO_ZERO_TIME);
        assert_eq!(v["ObjectInfo"]["LastModified"], GO_ZERO_TIME);
        assert!(v.get("VersionID").is_none());
        assert!(v.get("PartsInfo").is_none());
    }

    #[test]
    fn store_writes_files_the_loader_accepts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("launch.mp4.abc.upload");
        let fixture = load_fixture("upload_checkpoint.json");
        let mut cp: UploadCheckpoint = serde_json::from_value(fixture.clone()).unwrap();

        let store = CheckpointStore::new(cp.clone(), Some(path.clone()));
        let mut third = cp.parts_info[2].clone();
        third.etag = "\"ffff\"".into();
        third.is_completed = true;
        store.record_part_completion(third.clone()).unwrap();

        let on_disk: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk["PartsInfo"][2]["ETag"], "\"ffff\"");
        assert_eq!(on_disk["PartsInfo"][0], fixture["PartsInfo"][0]);

        cp.parts_info[2] = third;
        let loaded: UploadCheckpoint = load_checkpoint(&path).unwrap().unwrap();
        assert_eq!(loaded, cp);
    }
}
