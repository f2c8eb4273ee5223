//! Producer lifecycle: publishing a checkpoint, listing it, and retiring
//! it, including the argument and state-machine rejections.

mod common;

use common::{TestBuffer, TestCluster, KIB, MIB};
use moonshot_store::{MetadataStore, StoreError};

const SHARD: u64 = 256 * KIB;

#[tokio::test]
async fn register_publishes_one_gold_location_per_shard() {
    let cluster = TestCluster::new();
    let producer = cluster.engine("p1");
    let buffer = TestBuffer::patterned(4 * MIB, 7);

    producer
        .register("a/b", &[buffer.addr()], &[buffer.len()], SHARD)
        .await
        .expect("register");

    let (checkpoint, _) = cluster
        .metadata
        .get("a/b")
        .await
        .expect("get")
        .expect("present");
    assert_eq!(checkpoint.name, "a/b");
    assert_eq!(checkpoint.max_shard_size, SHARD);
    assert_eq!(checkpoint.size_list, vec![4 * MIB]);
    assert_eq!(checkpoint.shards.len(), 16);
    for (index, shard) in checkpoint.shards.iter().enumerate() {
        assert_eq!(shard.length, SHARD);
        assert_eq!(shard.gold.len(), 1);
        assert_eq!(shard.gold[0].segment_name, "p1");
        assert_eq!(shard.gold[0].offset, buffer.addr() + index as u64 * SHARD);
        assert!(shard.replica_list.is_empty());
    }
}

#[tokio::test]
async fn uneven_regions_get_a_short_tail_shard() {
    let cluster = TestCluster::new();
    let producer = cluster.engine("p1");
    let first = TestBuffer::patterned(MIB + 100 * KIB, 1);
    let second = TestBuffer::patterned(512 * KIB, 2);

    producer
        .register(
            "a/tail",
            &[first.addr(), second.addr()],
            &[first.len(), second.len()],
            SHARD,
        )
        .await
        .expect("register");

    let (checkpoint, _) = cluster
        .metadata
        .get("a/tail")
        .await
        .expect("get")
        .expect("present");
    // First region: 4 full shards + 100 KiB tail; second: 2 full shards.
    let lengths: Vec<u64> = checkpoint.shards.iter().map(|s| s.length).collect();
    assert_eq!(
        lengths,
        vec![SHARD, SHARD, SHARD, SHARD, 100 * KIB, SHARD, SHARD]
    );
    assert_eq!(checkpoint.shards[5].gold[0].offset, second.addr());
}

#[tokio::test]
async fn unregister_deletes_the_metadata_key() {
    let cluster = TestCluster::new();
    let producer = cluster.engine("p1");
    let buffer = TestBuffer::patterned(MIB, 3);

    producer
        .register("a/b", &[buffer.addr()], &[buffer.len()], SHARD)
        .await
        .expect("register");
    producer.unregister("a/b").await.expect("unregister");

    assert!(cluster.metadata.get("a/b").await.expect("get").is_none());
    assert_eq!(cluster.fabric.total_windows(), 0, "regions released");
}

#[tokio::test]
async fn list_projects_sizes_from_the_size_list() {
    let cluster = TestCluster::new();
    let producer = cluster.engine("p1");
    let first = TestBuffer::patterned(MIB, 4);
    let second = TestBuffer::patterned(2 * MIB, 5);

    producer
        .register(
            "team/a",
            &[first.addr(), second.addr()],
            &[first.len(), second.len()],
            SHARD,
        )
        .await
        .expect("register");

    let infos = producer.list("team/").await.expect("list");
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].name, "team/a");
    assert_eq!(infos[0].max_shard_size, SHARD);
    assert_eq!(infos[0].total_size, 3 * MIB);
    assert_eq!(infos[0].size_list, vec![MIB, 2 * MIB]);

    assert!(producer.list("other/").await.expect("list").is_empty());
}

#[tokio::test]
async fn register_rejects_malformed_region_lists() {
    let cluster = TestCluster::new();
    let producer = cluster.engine("p1");
    let buffer = TestBuffer::patterned(MIB, 6);

    let err = producer
        .register("", &[buffer.addr()], &[buffer.len()], SHARD)
        .await
        .expect_err("empty name");
    assert!(matches!(err, StoreError::InvalidArgument(_)));

    let err = producer
        .register("a/b", &[], &[], SHARD)
        .await
        .expect_err("empty lists");
    assert!(matches!(err, StoreError::InvalidArgument(_)));

    let err = producer
        .register("a/b", &[buffer.addr()], &[buffer.len(), MIB], SHARD)
        .await
        .expect_err("length mismatch");
    assert!(matches!(err, StoreError::InvalidArgument(_)));
}

#[tokio::test]
async fn register_rejects_a_shard_size_that_does_not_divide_the_chunk() {
    let cluster = TestCluster::new();
    let producer = cluster.engine("p1");
    let buffer = TestBuffer::patterned(MIB, 8);

    // 96 KiB against 1 MiB chunks: not a power of two, does not divide.
    let err = producer
        .register("a/b", &[buffer.addr()], &[buffer.len()], 96 * KIB)
        .await
        .expect_err("must reject");
    assert!(matches!(err, StoreError::InvalidArgument(_)));
    assert!(cluster.metadata.get("a/b").await.expect("get").is_none());
    assert_eq!(cluster.fabric.total_windows(), 0);
}

#[tokio::test]
async fn double_register_reports_already_open() {
    let cluster = TestCluster::new();
    let producer = cluster.engine("p1");
    let buffer = TestBuffer::patterned(MIB, 9);

    producer
        .register("a/b", &[buffer.addr()], &[buffer.len()], SHARD)
        .await
        .expect("register");
    let err = producer
        .register("a/b", &[buffer.addr()], &[buffer.len()], SHARD)
        .await
        .expect_err("second register");
    assert!(matches!(err, StoreError::AlreadyOpen(_)));
}

#[tokio::test]
async fn unregister_without_register_reports_already_closed() {
    let cluster = TestCluster::new();
    let producer = cluster.engine("p1");
    let err = producer.unregister("a/b").await.expect_err("not open");
    assert!(matches!(err, StoreError::AlreadyClosed(_)));

    let err = producer.delete_replica("a/b").await.expect_err("not open");
    assert!(matches!(err, StoreError::AlreadyClosed(_)));
}

#[tokio::test]
async fn get_replica_of_unknown_name_reports_not_found() {
    let cluster = TestCluster::new();
    let consumer = cluster.engine("p2");
    let buffer = TestBuffer::zeroed(MIB);

    let err = consumer
        .get_replica("missing", &[buffer.addr()], &[buffer.len()])
        .await
        .expect_err("unknown name");
    assert!(matches!(err, StoreError::NotFound(_)));
    assert_eq!(cluster.fabric.total_windows(), 0, "nothing pinned");
}

#[tokio::test]
async fn reregister_after_unregister_is_allowed() {
    let cluster = TestCluster::new();
    let producer = cluster.engine("p1");
    let buffer = TestBuffer::patterned(MIB, 10);

    producer
        .register("a/b", &[buffer.addr()], &[buffer.len()], SHARD)
        .await
        .expect("register");
    producer.unregister("a/b").await.expect("unregister");
    producer
        .register("a/b", &[buffer.addr()], &[buffer.len()], SHARD)
        .await
        .expect("register again");
    let (checkpoint, _) = cluster
        .metadata
        .get("a/b")
        .await
        .expect("get")
        .expect("present");
    assert_eq!(checkpoint.shards.len(), 4);
}
