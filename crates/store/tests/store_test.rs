//! End-to-end exercises of the store: upload, resolution, publication,
//! promulgation, blob access, and search projection.

use archive::testing::{bundle_archive, charm_archive};
use charmurl::{CharmUrl, ResolvedUrl};
use pretty_assertions::assert_eq;
use std::io::Read;
use std::sync::Arc;
use store::{AddParams, Channel, Entity, Error, ErrorCode, Kind, Store, StoreParams};

struct Fixture {
    dir: tempfile::TempDir,
    store: Store,
    index: Arc<search::MemIndex>,
}

fn fixture() -> Fixture {
    store::logging::init_logging("warn");
    let dir = tempfile::tempdir().unwrap();
    let index = Arc::new(search::MemIndex::new());
    let store = Store::open(StoreParams {
        database: dir.path().join("charmstore.db"),
        blob_root: dir.path().join("blobs"),
        index: Some(index.clone()),
        max_sessions: 10,
        request_timeout: std::time::Duration::from_secs(30),
    })
    .unwrap();
    Fixture { dir, store, index }
}

fn curl(s: &str) -> CharmUrl {
    s.parse().unwrap()
}

fn add_archive(store: &Store, id: &str, promulgated_revision: i32, body: &[u8]) -> Result<Entity, Error> {
    store.add(AddParams {
        id: ResolvedUrl::new(curl(id), promulgated_revision),
        reader: body,
        blob_hash: blobstore::hash_of(body),
        blob_size: body.len() as u64,
    })
}

fn add_charm(store: &Store, id: &str, promulgated_revision: i32, metadata: &str) -> Entity {
    add_archive(store, id, promulgated_revision, &charm_archive(metadata)).unwrap()
}

fn add_bundle(store: &Store, id: &str, bundle_yaml: &str) -> Result<Entity, Error> {
    add_archive(store, id, -1, &bundle_archive(bundle_yaml, "A bundle.\n"))
}

#[test]
fn upload_then_resolve_by_name_and_by_promulgated_id() {
    let f = fixture();
    let entity = add_charm(
        &f.store,
        "cs:~charmers/precise/wordpress-23",
        23,
        "name: wordpress\nsummary: blog\n",
    );
    assert_eq!(
        entity.promulgated_url,
        Some(curl("cs:precise/wordpress-23"))
    );
    f.store
        .publish(&curl("cs:~charmers/precise/wordpress-23"), &["stable"])
        .unwrap();

    let (resolved, by_name) = f.store.resolve(&curl("wordpress")).unwrap();
    assert_eq!(by_name.url, curl("cs:~charmers/precise/wordpress-23"));
    assert_eq!(resolved.promulgated_revision, 23);

    let (_, by_promulgated) = f.store.resolve(&curl("precise/wordpress-23")).unwrap();
    assert_eq!(by_promulgated.url, by_name.url);

    let err = f.store.resolve(&curl("precise/wordpress-22")).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[test]
fn multi_series_charm_disambiguation() {
    let f = fixture();
    add_charm(
        &f.store,
        "cs:~charmers/multi-series-1",
        -1,
        "name: multi-series\nseries: [precise, trusty, wily]\n",
    );

    let (_, entity) = f
        .store
        .resolve(&curl("~charmers/trusty/multi-series-1"))
        .unwrap();
    assert_eq!(entity.url, curl("cs:~charmers/multi-series-1"));
    assert!(entity.is_multi_series());

    let err = f
        .store
        .resolve(&curl("~charmers/quantal/multi-series-1"))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);

    // A later single-series upload cannot shadow a covered series.
    let err = add_archive(
        &f.store,
        "cs:~charmers/trusty/multi-series-2",
        -1,
        &charm_archive("name: multi-series\n"),
    )
    .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidEntity);
    assert_eq!(
        err.to_string(),
        "charm name duplicates multi-series charm name cs:~charmers/multi-series-1"
    );
}

#[test]
fn charm_and_bundle_names_do_not_mix() {
    let f = fixture();
    add_charm(
        &f.store,
        "cs:~tester/precise/wordpress-2",
        -1,
        "name: wordpress\n",
    );

    let err = add_bundle(
        &f.store,
        "cs:~tester/bundle/wordpress-5",
        "applications:\n  wordpress:\n    charm: cs:~tester/precise/wordpress-2\n    num_units: 1\n",
    )
    .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidEntity);
    assert_eq!(
        err.to_string(),
        "bundle name duplicates charm name cs:~tester/precise/wordpress-2"
    );
}

#[test]
fn hash_mismatch_leaves_no_observable_blob() {
    let f = fixture();
    let body = charm_archive("name: wordpress\n");
    let err = f
        .store
        .add(AddParams {
            id: ResolvedUrl::new(curl("cs:~charmers/precise/wordpress-0"), -1),
            reader: body.as_slice(),
            blob_hash: "blahblah".to_string(),
            blob_size: body.len() as u64,
        })
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::HashMismatch);

    let err = f
        .store
        .find_entity(&curl("cs:~charmers/precise/wordpress-0"))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);

    let blobs: Vec<_> = std::fs::read_dir(f.dir.path().join("blobs/blobs"))
        .unwrap()
        .collect();
    assert!(blobs.is_empty());
}

#[test]
fn failed_upload_rolls_back_every_blob() {
    let f = fixture();
    add_charm(
        &f.store,
        "cs:~charmers/multi-series-1",
        -1,
        "name: multi-series\nseries: [precise, trusty]\n",
    );
    let before = std::fs::read_dir(f.dir.path().join("blobs/blobs"))
        .unwrap()
        .count();
    assert_eq!(before, 2); // primary plus compat rewrite

    // A duplicate upload fails at insert, after its blobs were written.
    let err = add_archive(
        &f.store,
        "cs:~charmers/multi-series-1",
        -1,
        &charm_archive("name: multi-series\nseries: [precise, trusty]\n"),
    )
    .unwrap_err();
    assert_eq!(err.code(), ErrorCode::DuplicateUpload);
    let after = std::fs::read_dir(f.dir.path().join("blobs/blobs"))
        .unwrap()
        .count();
    assert_eq!(after, before);
}

#[test]
fn promulgation_transfers_to_new_owner_with_next_revision() {
    let f = fixture();
    add_charm(
        &f.store,
        "cs:~charmers/trusty/wordpress-0",
        0,
        "name: wordpress\n",
    );
    add_charm(&f.store, "cs:~test/trusty/wordpress-0", -1, "name: wordpress\n");

    f.store
        .set_promulgated(&curl("cs:~test/trusty/wordpress-0"), true)
        .unwrap();

    let charmers = f
        .store
        .find_base_entity(&curl("cs:~charmers/wordpress"))
        .unwrap();
    assert!(!charmers.promulgated);
    let test = f.store.find_base_entity(&curl("cs:~test/wordpress")).unwrap();
    assert!(test.promulgated);

    let entity = f
        .store
        .find_entity(&curl("cs:~test/trusty/wordpress-0"))
        .unwrap();
    assert_eq!(entity.promulgated_url, Some(curl("cs:trusty/wordpress-1")));
    assert_eq!(entity.promulgated_revision, 1);

    // Demotion keeps historical numbering.
    f.store
        .set_promulgated(&curl("cs:~test/trusty/wordpress-0"), false)
        .unwrap();
    let test = f.store.find_base_entity(&curl("cs:~test/wordpress")).unwrap();
    assert!(!test.promulgated);
    let entity = f
        .store
        .find_entity(&curl("cs:~test/trusty/wordpress-0"))
        .unwrap();
    assert_eq!(entity.promulgated_url, Some(curl("cs:trusty/wordpress-1")));
}

#[test]
fn id_validation_on_upload() {
    let f = fixture();
    let body = charm_archive("name: wordpress\n");

    let err = add_archive(&f.store, "cs:~charmers/precise/wordpress", -1, &body).unwrap_err();
    assert_eq!(err.code(), ErrorCode::IdNotAllowed);

    let err = add_archive(&f.store, "cs:precise/wordpress-1", -1, &body).unwrap_err();
    assert_eq!(err.code(), ErrorCode::IdNotAllowed);

    // A series-less id needs a multi-series archive.
    let err = add_archive(&f.store, "cs:~charmers/wordpress-1", -1, &body).unwrap_err();
    assert_eq!(err.code(), ErrorCode::IdNotAllowed);

    // The id's series must be declared by the archive when it declares
    // any.
    let err = add_archive(
        &f.store,
        "cs:~charmers/wily/wordpress-1",
        -1,
        &charm_archive("name: wordpress\nseries: [precise, trusty]\n"),
    )
    .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidEntity);

    let err = add_archive(&f.store, "cs:~charmers/warty/wordpress-1", -1, &body).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidEntity);

    // Bundle ids must carry bundle archives and vice versa.
    let err = add_archive(&f.store, "cs:~charmers/bundle/wordpress-1", -1, &body).unwrap_err();
    assert_eq!(err.to_string(), "bundle archive expected");
}

#[test]
fn bundle_upload_computes_counts_and_references() {
    let f = fixture();
    add_charm(&f.store, "cs:~tester/trusty/wordpress-0", -1, "name: wordpress\n");
    add_charm(&f.store, "cs:~tester/trusty/mysql-0", -1, "name: mysql\n");

    let entity = add_bundle(
        &f.store,
        "cs:~tester/bundle/wp-simple-0",
        r#"
applications:
  wordpress:
    charm: cs:~tester/trusty/wordpress-0
    num_units: 2
  mysql:
    charm: cs:~tester/trusty/mysql-0
    num_units: 1
    to: ["lxc:new"]
relations:
  - [wordpress:db, mysql:server]
"#,
    )
    .unwrap();

    match &entity.kind {
        Kind::Bundle {
            charms,
            machine_count,
            unit_count,
            ..
        } => {
            assert_eq!(*unit_count, 3);
            assert_eq!(*machine_count, 3);
            assert_eq!(
                charms.clone(),
                vec![
                    curl("cs:~tester/trusty/mysql-0"),
                    curl("cs:~tester/trusty/wordpress-0"),
                ]
            );
        }
        Kind::Charm { .. } => panic!("expected a bundle"),
    }

    // A bundle naming an unknown charm fails verification.
    let err = add_bundle(
        &f.store,
        "cs:~tester/bundle/wp-broken-0",
        "applications:\n  wordpress:\n    charm: cs:~tester/trusty/nginx-9\n",
    )
    .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidEntity);
    assert!(err.to_string().contains("not found"), "{err}");
}

#[test]
fn publish_moves_pointers_and_stable_implies_development_flag() {
    let f = fixture();
    add_charm(&f.store, "cs:~who/trusty/app-1", -1, "name: app\n");
    let id = curl("cs:~who/trusty/app-1");

    // Unknown channels are dropped; dropping everything is an error.
    let err = f.store.publish(&id, &["beta", "candidate"]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoChannels);
    let err = f.store.publish(&id, &[]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoChannels);

    f.store.publish(&id, &["stable", "edge"]).unwrap();
    let entity = f.store.find_entity(&id).unwrap();
    assert!(entity.stable);
    assert!(entity.development); // stable implies development

    let base = f.store.find_base_entity(&id).unwrap();
    assert_eq!(base.current(Channel::Stable, "trusty"), Some(&id));
    // The development pointer was not touched by a stable-only publish.
    assert_eq!(base.current(Channel::Development, "trusty"), None);

    // Publishing an older revision to development only moves development.
    add_charm(&f.store, "cs:~who/trusty/app-2", -1, "name: app\n");
    let id2 = curl("cs:~who/trusty/app-2");
    f.store.publish(&id2, &["development"]).unwrap();
    let base = f.store.find_base_entity(&id).unwrap();
    assert_eq!(base.current(Channel::Stable, "trusty"), Some(&id));
    assert_eq!(base.current(Channel::Development, "trusty"), Some(&id2));

    let entity = f.store.find_entity(&id2).unwrap();
    assert!(entity.development);
    assert!(!entity.stable);
}

#[test]
fn publish_multi_series_moves_all_series_pointers() {
    let f = fixture();
    add_charm(
        &f.store,
        "cs:~who/multi-3",
        -1,
        "name: multi\nseries: [precise, trusty, wily]\n",
    );
    let id = curl("cs:~who/multi-3");
    f.store.publish(&id, &["stable"]).unwrap();

    let base = f.store.find_base_entity(&id).unwrap();
    for series in ["precise", "trusty", "wily"] {
        assert_eq!(base.current(Channel::Stable, series), Some(&id));
    }
}

#[test]
fn resolver_prefers_stable_then_series_then_revision() {
    let f = fixture();
    add_charm(&f.store, "cs:~who/trusty/app-1", -1, "name: app\n");
    add_charm(&f.store, "cs:~who/trusty/app-2", -1, "name: app\n");
    f.store.publish(&curl("cs:~who/trusty/app-1"), &["stable"]).unwrap();
    f.store
        .publish(&curl("cs:~who/trusty/app-2"), &["development"])
        .unwrap();

    // Stable beats development even at a lower revision.
    let (_, entity) = f.store.resolve(&curl("~who/app")).unwrap();
    assert_eq!(entity.url, curl("cs:~who/trusty/app-1"));

    // Once the newer revision reaches stable, the revision decides.
    f.store.publish(&curl("cs:~who/trusty/app-2"), &["stable"]).unwrap();
    let (_, entity) = f.store.resolve(&curl("~who/app")).unwrap();
    assert_eq!(entity.url, curl("cs:~who/trusty/app-2"));

    // An unpublished revision resolves only when fully qualified.
    add_charm(&f.store, "cs:~who/trusty/app-3", -1, "name: app\n");
    let (_, entity) = f.store.resolve(&curl("~who/app")).unwrap();
    assert_eq!(entity.url, curl("cs:~who/trusty/app-2"));
    let (_, entity) = f.store.resolve(&curl("~who/trusty/app-3")).unwrap();
    assert_eq!(entity.url, curl("cs:~who/trusty/app-3"));
}

#[test]
fn resolver_series_less_queries() {
    let f = fixture();
    add_charm(&f.store, "cs:~who/trusty/single-7", -1, "name: single\n");
    // Fully qualified by revision but without a series: only
    // multi-series charms and bundles qualify.
    let err = f.store.resolve(&curl("~who/single-7")).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);

    add_charm(
        &f.store,
        "cs:~who/multi-2",
        -1,
        "name: multi\nseries: [precise, trusty]\n",
    );
    let (_, entity) = f.store.resolve(&curl("~who/multi-2")).unwrap();
    assert_eq!(entity.url, curl("cs:~who/multi-2"));
}

#[test]
fn find_entities_matches_patterns() {
    let f = fixture();
    add_charm(&f.store, "cs:~a/precise/app-1", -1, "name: app\n");
    add_charm(&f.store, "cs:~a/precise/app-2", -1, "name: app\n");
    add_charm(&f.store, "cs:~a/trusty/app-1", -1, "name: app\n");
    add_charm(&f.store, "cs:~b/precise/app-1", -1, "name: app\n");

    let urls = |pattern: &str| -> Vec<String> {
        f.store
            .find_entities(&curl(pattern))
            .unwrap()
            .into_iter()
            .map(|e| e.url.to_string())
            .collect()
    };

    assert_eq!(urls("app").len(), 4);
    assert_eq!(
        urls("~a/app"),
        vec![
            "cs:~a/precise/app-1",
            "cs:~a/precise/app-2",
            "cs:~a/trusty/app-1",
        ]
    );
    assert_eq!(urls("~a/trusty/app"), vec!["cs:~a/trusty/app-1"]);
    assert_eq!(
        urls("app-1"),
        vec!["cs:~a/precise/app-1", "cs:~a/trusty/app-1", "cs:~b/precise/app-1"]
    );
    assert_eq!(urls("mysql"), Vec::<String>::new());
}

#[test]
fn matching_interfaces_finds_relatable_charms() {
    let f = fixture();
    add_charm(
        &f.store,
        "cs:~who/trusty/wordpress-1",
        -1,
        "name: wordpress\nprovides:\n  website:\n    interface: http\nrequires:\n  db: mysql\n",
    );
    add_charm(
        &f.store,
        "cs:~who/trusty/haproxy-1",
        -1,
        "name: haproxy\nrequires:\n  backend: http\n",
    );

    let found = f
        .store
        .matching_interfaces(&["mysql"], &["http"])
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].url, curl("cs:~who/trusty/wordpress-1"));

    assert!(f
        .store
        .matching_interfaces(&["nosuch"], &["http"])
        .unwrap()
        .is_empty());
}

#[test]
fn blob_round_trip_and_pre_v5_fields() {
    let f = fixture();
    let single_body = charm_archive("name: app\n");
    let entity = add_archive(&f.store, "cs:~who/trusty/app-1", -1, &single_body).unwrap();
    assert_eq!(entity.prev5_blob_hash, entity.blob_hash);
    assert_eq!(entity.prev5_blob_size, entity.blob_size);

    let (mut reader, hash, size) = f.store.open_blob(&curl("cs:~who/trusty/app-1")).unwrap();
    let mut read_back = Vec::new();
    reader.read_to_end(&mut read_back).unwrap();
    assert_eq!(read_back, single_body);
    assert_eq!(hash, blobstore::hash_of(&read_back));
    assert_eq!(size, read_back.len() as i64);

    let entity = add_archive(
        &f.store,
        "cs:~who/multi-1",
        -1,
        &charm_archive("name: multi\nseries: [precise, trusty]\n"),
    )
    .unwrap();
    assert_ne!(entity.prev5_blob_hash, entity.blob_hash);
    assert_ne!(entity.prev5_blob_name, entity.blob_name);

    // The compat blob parses as a charm with no declared series.
    let (mut reader, hash, _) = f.store.open_blob_pre_v5(&curl("cs:~who/multi-1")).unwrap();
    let mut compat = Vec::new();
    reader.read_to_end(&mut compat).unwrap();
    assert_eq!(hash, blobstore::hash_of(&compat));
    let charm = archive::read_charm(std::io::Cursor::new(compat)).unwrap();
    assert_eq!(charm.meta.series, Vec::<String>::new());
}

#[test]
fn cached_file_lookup_records_hits_and_misses() {
    let f = fixture();
    let body = archive::testing::ZipBuilder::new()
        .file("metadata.yaml", "name: app\n")
        .file("icon.svg", "<svg>icon</svg>")
        .build();
    add_archive(&f.store, "cs:~who/trusty/app-1", -1, &body).unwrap();
    let id = curl("cs:~who/trusty/app-1");

    let mut icon = String::new();
    f.store
        .open_icon(&id)
        .unwrap()
        .read_to_string(&mut icon)
        .unwrap();
    assert_eq!(icon, "<svg>icon</svg>");

    // The location is cached: a second read must not scan again.
    let mut icon = String::new();
    f.store
        .open_cached_file(&id, store::FILE_ICON, |_| {
            panic!("predicate must not run on a cached hit")
        })
        .unwrap()
        .read_to_string(&mut icon)
        .unwrap();
    assert_eq!(icon, "<svg>icon</svg>");

    // A miss is recorded as a sentinel and short-circuits later calls.
    let mut calls = 0;
    let err = f
        .store
        .open_cached_file(&id, "banner", |name| {
            calls += 1;
            name == "banner.png"
        })
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
    assert!(calls > 0);

    let err = f
        .store
        .open_cached_file(&id, "banner", |_| {
            panic!("predicate must not run once the miss is recorded")
        })
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[test]
fn search_index_tracks_latest_revisions() {
    let f = fixture();
    add_charm(&f.store, "cs:~who/trusty/app-1", -1, "name: app\nsummary: one\n");
    assert_eq!(f.index.doc_ids("entities-1"), vec!["cs:~who/trusty/app-1"]);

    add_charm(&f.store, "cs:~who/trusty/app-2", -1, "name: app\nsummary: two\n");
    assert_eq!(f.index.doc_ids("entities-1"), vec!["cs:~who/trusty/app-2"]);

    f.store.publish(&curl("cs:~who/trusty/app-2"), &["stable"]).unwrap();
    let docs = f.index.docs("entities-1");
    assert!(docs["cs:~who/trusty/app-2"].stable);

    // ACL changes re-project.
    f.store
        .set_channel_acl(
            &curl("cs:~who/trusty/app-2"),
            Channel::Stable,
            store::Acl {
                read: vec!["everyone".to_string()],
                write: vec!["who".to_string()],
            },
        )
        .unwrap();
    let docs = f.index.docs("entities-1");
    assert_eq!(
        docs["cs:~who/trusty/app-2"].read_acls["stable"],
        vec!["everyone".to_string()]
    );
}

#[test]
fn search_index_failures_do_not_abort_and_resync_recovers() {
    let f = fixture();
    f.index.set_failing(true);

    // Uploads succeed even though the index is unreachable.
    add_charm(&f.store, "cs:~who/trusty/app-1", -1, "name: app\n");
    f.store.publish(&curl("cs:~who/trusty/app-1"), &["stable"]).unwrap();
    assert_eq!(f.index.doc_ids("entities-1"), Vec::<String>::new());

    f.index.set_failing(false);
    let indexed = f.store.sync_search().unwrap();
    assert_eq!(indexed, 1);
    let docs = f.index.docs("entities-1");
    assert!(docs["cs:~who/trusty/app-1"].stable);
}

#[test]
fn promulgation_reindexes_both_owners() {
    let f = fixture();
    add_charm(&f.store, "cs:~charmers/trusty/app-0", 0, "name: app\n");
    add_charm(&f.store, "cs:~test/trusty/app-0", -1, "name: app\n");
    f.store
        .set_promulgated(&curl("cs:~test/trusty/app-0"), true)
        .unwrap();

    let docs = f.index.docs("entities-1");
    assert_eq!(
        docs["cs:~test/trusty/app-0"].promulgated_url.as_deref(),
        Some("cs:trusty/app-1")
    );
    assert_eq!(
        docs["cs:~charmers/trusty/app-0"].promulgated_url.as_deref(),
        Some("cs:trusty/app-0")
    );
}

#[test]
fn extra_info_and_audit_log() {
    let f = fixture();
    add_charm(&f.store, "cs:~who/trusty/app-1", -1, "name: app\n");
    let id = curl("cs:~who/trusty/app-1");

    f.store
        .update_extra_info(&id, "vcs-revision", Some(&serde_json::json!("abc123")))
        .unwrap();
    let entity = f.store.find_entity(&id).unwrap();
    assert_eq!(entity.extra_info["vcs-revision"], serde_json::json!("abc123"));

    f.store.update_extra_info(&id, "vcs-revision", None).unwrap();
    let entity = f.store.find_entity(&id).unwrap();
    assert!(entity.extra_info.is_empty());

    let log = f.store.list_audit_log().unwrap();
    let kinds: Vec<&str> = log.iter().map(|e| e.kind.as_str()).collect();
    assert_eq!(kinds, vec!["upload", "set-extra-info", "set-extra-info"]);
}

#[test]
fn closed_store_refuses_operations() {
    let f = fixture();
    add_charm(&f.store, "cs:~who/trusty/app-1", -1, "name: app\n");
    f.store.close();
    f.store.close(); // idempotent

    let err = f.store.find_entity(&curl("cs:~who/trusty/app-1")).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Closed);
}

#[test]
fn duplicate_upload_is_rejected() {
    let f = fixture();
    add_charm(&f.store, "cs:~who/trusty/app-1", -1, "name: app\n");
    let err = add_archive(
        &f.store,
        "cs:~who/trusty/app-1",
        -1,
        &charm_archive("name: app\n"),
    )
    .unwrap_err();
    assert_eq!(err.code(), ErrorCode::DuplicateUpload);
}
