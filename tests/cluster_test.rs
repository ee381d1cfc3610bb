//! Cluster behavior under partition failures: replication, failover,
//! liveness, degradation.

mod common;

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use driftfs::{download_bytes, upload_bytes, ClusterConfig, FileSystem, FsError};

    use crate::common::{outage, test_cluster};

    fn lenient_config() -> ClusterConfig {
        ClusterConfig {
            dead_threshold: 2,
            upload_min: 1,
            upload_max: 2,
        }
    }

    #[tokio::test]
    async fn test_upload_with_one_partition_down() -> anyhow::Result<()> {
        let tc = test_cluster(3, lenient_config()).await;
        tc.flaky[0].set_healthy(false);
        tc.partitions.mark_dead("p0", &outage());

        upload_bytes(&tc.cluster, "x", Bytes::from_static(b"hello")).await?;

        // Exactly two replicas hold the bytes, both on healthy partitions.
        let mut holders = 0;
        for store in &tc.stores[1..] {
            if store.info("x").await?.is_some() {
                assert_eq!(download_bytes(store.as_ref(), "x").await?, Bytes::from_static(b"hello"));
                holders += 1;
            }
        }
        assert_eq!(holders, 2);
        assert!(tc.stores[0].info("x").await?.is_none());

        assert_eq!(tc.partitions.dead_ids(), vec!["p0".to_string()]);
        assert_eq!(tc.cluster.info("x").await?.unwrap().size, 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_survives_mid_stream_failure() -> anyhow::Result<()> {
        let tc = test_cluster(3, lenient_config()).await;
        tc.flaky[0].set_healthy(false);
        tc.partitions.mark_dead("p0", &outage());
        // p1 dies after three bytes; p2 carries the upload home.
        tc.flaky[1].fail_uploads_after(3);

        let mut sink = tc.cluster.upload("x", None).await?;
        sink.push(Bytes::from_static(b"hel")).await?;
        sink.push(Bytes::from_static(b"lo")).await?;
        sink.finish().await?;

        assert_eq!(download_bytes(&tc.cluster, "x").await?, Bytes::from_static(b"hello"));
        assert_eq!(download_bytes(tc.stores[2].as_ref(), "x").await?, Bytes::from_static(b"hello"));
        assert!(tc.stores[1].info("x").await?.is_none());

        let mut dead = tc.partitions.dead_ids();
        dead.sort();
        assert_eq!(dead, vec!["p0".to_string(), "p1".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_fails_when_all_targets_die() -> anyhow::Result<()> {
        let tc = test_cluster(3, lenient_config()).await;
        tc.flaky[0].set_healthy(false);
        tc.partitions.mark_dead("p0", &outage());
        tc.flaky[1].fail_uploads_after(3);
        tc.flaky[2].fail_uploads_after(3);

        let mut sink = tc.cluster.upload("x", None).await?;
        let err = async {
            sink.push(Bytes::from_static(b"hel")).await?;
            sink.push(Bytes::from_static(b"lo")).await?;
            sink.finish().await
        }
        .await
        .unwrap_err();
        assert!(
            matches!(err, FsError::NotEnoughUploadTargets { .. }),
            "got {err:?}"
        );

        assert_eq!(tc.partitions.dead_count(), 3);
        // Every partition gone: the cluster is degraded and refuses work.
        let err = tc.cluster.upload("y", None).await.unwrap_err();
        assert!(matches!(err, FsError::ClusterDegraded { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_download_fails_over_between_replicas() -> anyhow::Result<()> {
        let tc = test_cluster(
            3,
            ClusterConfig {
                dead_threshold: 2,
                upload_min: 1,
                upload_max: 3,
            },
        )
        .await;
        upload_bytes(&tc.cluster, "x", Bytes::from_static(b"hello")).await?;

        // Whichever replicas get elected first die after two bytes; the
        // combiner must splice the tail from a survivor.
        tc.flaky[0].fail_downloads_after(2);
        tc.flaky[1].fail_downloads_after(2);

        assert_eq!(download_bytes(&tc.cluster, "x").await?, Bytes::from_static(b"hello"));
        Ok(())
    }

    #[tokio::test]
    async fn test_replicas_are_byte_equal() -> anyhow::Result<()> {
        let tc = test_cluster(
            3,
            ClusterConfig {
                dead_threshold: 0,
                upload_min: 3,
                upload_max: 3,
            },
        )
        .await;

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut sink = tc.cluster.upload("blob", Some(payload.len() as u64)).await?;
        for chunk in payload.chunks(64 * 1024) {
            sink.push(Bytes::copy_from_slice(chunk)).await?;
        }
        sink.finish().await?;

        for store in &tc.stores {
            let replica = download_bytes(store.as_ref(), "blob").await?;
            assert_eq!(replica.as_ref(), payload.as_slice());
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_all_application_error_does_not_evict() -> anyhow::Result<()> {
        let tc = test_cluster(3, lenient_config()).await;
        upload_bytes(&tc.cluster, "a", Bytes::from_static(b"1")).await?;
        // Partition p1 has a directory squatting on the name "b".
        std::fs::create_dir(tc.dirs[1].path().join("b"))?;

        let err = tc
            .cluster
            .delete_all(&["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert!(err.is_application(), "got {err:?}");
        assert_eq!(tc.partitions.dead_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_ping_reconciliation_restores_partition() -> anyhow::Result<()> {
        let tc = test_cluster(3, lenient_config()).await;
        tc.flaky[0].set_healthy(false);

        tc.cluster.ping().await?;
        assert_eq!(tc.partitions.dead_ids(), vec!["p0".to_string()]);

        tc.flaky[0].set_healthy(true);
        tc.partitions.check_dead_partitions().await;
        assert_eq!(tc.partitions.dead_count(), 0);
        assert!(tc.partitions.select("n").contains(&"p0".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_degraded_cluster_fails_fast() -> anyhow::Result<()> {
        let tc = test_cluster(
            2,
            ClusterConfig {
                dead_threshold: 0,
                upload_min: 1,
                upload_max: 1,
            },
        )
        .await;
        tc.partitions.mark_dead("p0", &outage());

        for err in [
            tc.cluster.upload("x", None).await.err().unwrap(),
            tc.cluster.download("x", 0, 10).await.err().unwrap(),
            tc.cluster.list("**").await.err().unwrap(),
            tc.cluster.delete("x").await.err().unwrap(),
        ] {
            assert!(matches!(err, FsError::ClusterDegraded { .. }), "got {err:?}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_needs_min_targets() -> anyhow::Result<()> {
        let tc = test_cluster(
            3,
            ClusterConfig {
                dead_threshold: 2,
                upload_min: 2,
                upload_max: 2,
            },
        )
        .await;
        tc.partitions.mark_dead("p0", &outage());
        tc.partitions.mark_dead("p1", &outage());

        let err = tc.cluster.upload("x", None).await.unwrap_err();
        assert!(matches!(
            err,
            FsError::NotEnoughUploadTargets { required: 2, got: 1 }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_download_distinguishes_absence_from_outage() -> anyhow::Result<()> {
        let tc = test_cluster(3, lenient_config()).await;

        // Nothing uploaded, everyone healthy: plain absence.
        let err = tc.cluster.download("ghost", 0, 10).await.unwrap_err();
        assert!(matches!(err, FsError::FileNotFound(_)));

        // A replica is unreachable: absence can no longer be claimed.
        tc.flaky[0].set_healthy(false);
        let err = tc.cluster.download("ghost", 0, 10).await.unwrap_err();
        assert!(matches!(err, FsError::NoReplicasAvailable(_)), "got {err:?}");
        Ok(())
    }

    #[tokio::test]
    async fn test_list_and_info_merge_newest_replica() -> anyhow::Result<()> {
        let tc = test_cluster(3, lenient_config()).await;
        // A stale, smaller replica predates the real upload.
        upload_bytes(tc.stores[0].as_ref(), "f", Bytes::from_static(b"a")).await?;
        upload_bytes(&tc.cluster, "f", Bytes::from_static(b"abc")).await?;

        let all = tc.cluster.list("**").await?;
        assert_eq!(all["f"].size, 3);
        assert_eq!(tc.cluster.info("f").await?.unwrap().size, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_copy_and_rename_through_cluster() -> anyhow::Result<()> {
        let tc = test_cluster(3, lenient_config()).await;
        upload_bytes(&tc.cluster, "orig", Bytes::from_static(b"payload")).await?;

        tc.cluster.copy("orig", "copy").await?;
        assert_eq!(download_bytes(&tc.cluster, "copy").await?, Bytes::from_static(b"payload"));
        assert!(tc.cluster.info("orig").await?.is_some());

        tc.cluster.rename("copy", "moved").await?;
        assert!(tc.cluster.info("copy").await?.is_none());
        assert_eq!(download_bytes(&tc.cluster, "moved").await?, Bytes::from_static(b"payload"));

        // rename onto itself is a no-op, not a delete
        tc.cluster.rename("moved", "moved").await?;
        assert!(tc.cluster.info("moved").await?.is_some());
        Ok(())
    }
}
