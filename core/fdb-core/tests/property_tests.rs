// 속성 기반 테스트: 왕복 보존과 KV 샤드 스캔 경계

use fdb_core::index::kv::KV_STORE_NAME;
use fdb_core::index::{IndexBackend, KvIndex, KvRegistry};
use fdb_core::{Fdb, FdbConfig, Field, FieldLocation, Key, Request, RootConfig, SchemaRegistry};
use proptest::collection::{btree_map, vec};
use proptest::prelude::*;
use std::fs;
use std::sync::Arc;
use tempfile::tempdir;

const SCHEMA: &str = "step: Step;\n[ class, expver [ type [ step, param ]]]";

fn key(step: u32, param: &str) -> Key {
    Key::from_pairs([
        ("class", "od"),
        ("expver", "0001"),
        ("type", "fc"),
        ("step", step.to_string().as_str()),
        ("param", param),
    ])
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Every archived buffer comes back byte for byte through a fresh handle.
    #[test]
    fn prop_round_trip(
        fields in btree_map(0u32..240, vec(any::<u8>(), 0..512), 1..8),
    ) {
        let dir = tempdir().unwrap();
        let schema_path = dir.path().join("schema");
        fs::write(&schema_path, SCHEMA).unwrap();
        let config = FdbConfig {
            roots: vec![RootConfig::new(dir.path().join("root"))],
            schema_path,
            data_block_size: 64,
            ..FdbConfig::default()
        };
        let open = || {
            Fdb::with_registries(
                config.clone(),
                Arc::new(SchemaRegistry::new()),
                Arc::new(KvRegistry::new()),
            )
            .unwrap()
        };

        let writer = open();
        for (step, data) in &fields {
            writer.archive(&key(*step, "t"), data).unwrap();
        }
        writer.flush().unwrap();

        let reader = open();
        for (step, data) in &fields {
            let result = reader.retrieve(&Request::from(&key(*step, "t"))).unwrap();
            prop_assert_eq!(result.len(), 1);
            prop_assert_eq!(&reader.read(&result.fields[0]).unwrap(), data);
        }
    }

    /// A visit of one index never sees entries of another index sharing the
    /// same store, whatever the insertion order.
    #[test]
    fn prop_kv_visit_stays_in_shard(
        ops in vec((0usize..3, 0u32..1000), 1..64),
    ) {
        let dir = tempdir().unwrap();
        let registry = KvRegistry::new();
        let db = registry.open(&dir.path().join(KV_STORE_NAME)).unwrap();
        let mut indexes: Vec<KvIndex> = (0..3)
            .map(|i| KvIndex::create(db.clone(), &dir.path().join(format!("{i}.index"))).unwrap())
            .collect();

        let mut expected = vec![std::collections::BTreeSet::new(); 3];
        for (target, n) in &ops {
            let fingerprint = format!("{target}:{n}");
            let field = Field::new(FieldLocation::file("/data", u64::from(*n), 1));
            indexes[*target].put(&fingerprint, &field).unwrap();
            expected[*target].insert(fingerprint);
        }

        for (i, index) in indexes.iter().enumerate() {
            let mut seen = std::collections::BTreeSet::new();
            index
                .visit(&mut |fingerprint, _| {
                    seen.insert(fingerprint.to_string());
                    true
                })
                .unwrap();
            prop_assert_eq!(&seen, &expected[i]);
        }
    }
}
