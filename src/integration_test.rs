#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use crate::{
        data_model::{JobId, JobStatus},
        notify::SubscriberHandle,
        testing::{
            data_chunk_message,
            first_chunk_message,
            job_metadata_json,
            TestService,
            COPY_TRANSFORM,
            HANG_TRANSFORM,
            KEY_MISMATCH_TRANSFORM,
            SIDECAR_TRANSFORM,
        },
    };

    const TERMINAL_WAIT: Duration = Duration::from_secs(10);

    async fn send_job(
        service: &TestService,
        job_id: &str,
        payloads: &[&[u8]],
        order: &[usize],
    ) {
        let metadata = job_metadata_json("img.png", "ENCRYPT", "AES-256-CBC");
        service
            .orchestrator
            .handle_chunk(first_chunk_message(
                job_id,
                payloads.len() as u32,
                &metadata,
            ))
            .await
            .unwrap();
        for &i in order {
            service
                .orchestrator
                .handle_chunk(data_chunk_message(
                    job_id,
                    i as u32,
                    payloads.len() as u32,
                    payloads[i],
                ))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn in_order_job_is_assembled_processed_and_uploaded() {
        let service = TestService::new(COPY_TRANSFORM).unwrap();
        let payloads: &[&[u8]] = &[b"aaaaaaaaaa", b"bbbbbbbbbb", b"cccccccccc"];
        send_job(&service, "job-a", payloads, &[0, 1, 2]).await;

        let event = service.wait_for_terminal("job-a", TERMINAL_WAIT).await;
        assert_eq!(event.status, JobStatus::Done);
        let artifact_id = event.artifact_id.clone().unwrap();
        assert_eq!(
            event.download_url.as_deref(),
            Some(format!("/api/artifacts/{artifact_id}/download").as_str())
        );

        // RUNNING was announced before the terminal event
        let events = service.events_for("job-a");
        assert_eq!(events[0].status, JobStatus::Running);
        assert_eq!(events.len(), 2);

        assert_eq!(
            service.catalog.jobs_created.lock().unwrap().as_slice(),
            &[JobId::from("job-a")]
        );
        let uploads = service.catalog.uploads.lock().unwrap();
        // one record for the original payload, one finalized for the output
        assert_eq!(uploads.len(), 2);
        let processed = uploads.iter().find(|u| u.finalized.is_some()).unwrap();
        assert_eq!(processed.request.original_file_name, "processed_img.png");
        assert_eq!(
            processed.assembled_bytes(),
            b"aaaaaaaaaabbbbbbbbbbcccccccccc"
        );
        drop(uploads);

        let updates = service.catalog.status_updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1, JobStatus::Done);
        assert_eq!(updates[0].2.as_ref(), Some(&artifact_id));

        // temp files are gone on the terminal edge
        assert!(!service.work_dir().join("job-a_assembled.dat").exists());
        assert!(!service.work_dir().join("job-a").exists());
        assert!(service.orchestrator.registry().is_empty());
    }

    #[tokio::test]
    async fn out_of_order_delivery_produces_identical_artifact() {
        let service = TestService::new(COPY_TRANSFORM).unwrap();
        let payloads: &[&[u8]] = &[b"aaaaaaaaaa", b"bbbbbbbbbb", b"cccccccccc"];
        send_job(&service, "job-b", payloads, &[2, 0, 1]).await;

        let event = service.wait_for_terminal("job-b", TERMINAL_WAIT).await;
        assert_eq!(event.status, JobStatus::Done);
        let uploads = service.catalog.uploads.lock().unwrap();
        let processed = uploads.iter().find(|u| u.finalized.is_some()).unwrap();
        assert_eq!(
            processed.assembled_bytes(),
            b"aaaaaaaaaabbbbbbbbbbcccccccccc"
        );
    }

    #[tokio::test]
    async fn registration_failure_terminates_the_job_before_processing() {
        let service = TestService::new(COPY_TRANSFORM).unwrap();
        service
            .catalog
            .fail_create_job
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let metadata = job_metadata_json("img.png", "ENCRYPT", "AES-256-CBC");
        service
            .orchestrator
            .handle_chunk(first_chunk_message("job-c", 3, &metadata))
            .await
            .unwrap();

        let event = service.wait_for_terminal("job-c", TERMINAL_WAIT).await;
        assert_eq!(event.status, JobStatus::Error);

        // never announced RUNNING, never uploaded anything
        let events = service.events_for("job-c");
        assert_eq!(events.len(), 1);
        assert_eq!(service.catalog.finalized_uploads(), 0);
        let updates = service.catalog.status_updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1, JobStatus::Error);
        drop(updates);
        assert!(service.orchestrator.registry().is_empty());
    }

    #[tokio::test]
    async fn key_mismatch_output_maps_to_the_canned_message() {
        let service = TestService::new(KEY_MISMATCH_TRANSFORM).unwrap();
        send_job(&service, "job-d", &[b"0123456789"], &[0]).await;

        let event = service.wait_for_terminal("job-d", TERMINAL_WAIT).await;
        assert_eq!(event.status, JobStatus::Error);
        assert_eq!(
            event.error_message.as_deref(),
            Some("Decryption failed: the provided key or IV does not match this file")
        );
        assert_eq!(service.catalog.finalized_uploads(), 0);
    }

    #[tokio::test]
    async fn watchdog_kills_a_hung_transform_and_cleans_up() {
        let service = TestService::with_watchdog(HANG_TRANSFORM, 1).unwrap();
        send_job(&service, "job-e", &[b"0123456789"], &[0]).await;

        let event = service.wait_for_terminal("job-e", TERMINAL_WAIT).await;
        assert_eq!(event.status, JobStatus::Error);
        assert!(event.error_message.unwrap().contains("timed out"));
        assert!(!service.work_dir().join("job-e_assembled.dat").exists());
        assert!(!service.work_dir().join("job-e").exists());
    }

    #[tokio::test]
    async fn transform_sidecar_metadata_rides_on_the_finalize_call() {
        let service = TestService::new(SIDECAR_TRANSFORM).unwrap();
        send_job(&service, "job-f", &[b"0123456789"], &[0]).await;

        let event = service.wait_for_terminal("job-f", TERMINAL_WAIT).await;
        assert_eq!(event.status, JobStatus::Done);
        let uploads = service.catalog.uploads.lock().unwrap();
        let finalized = uploads
            .iter()
            .find_map(|u| u.finalized.as_ref())
            .unwrap();
        assert_eq!(
            finalized.extra_metadata,
            Some(serde_json::json!({"width": 100}))
        );
    }

    #[tokio::test]
    async fn upload_failure_is_a_terminal_error() {
        let service = TestService::new(COPY_TRANSFORM).unwrap();
        service
            .catalog
            .fail_finalize
            .store(true, std::sync::atomic::Ordering::SeqCst);
        send_job(&service, "job-g", &[b"0123456789"], &[0]).await;

        let event = service.wait_for_terminal("job-g", TERMINAL_WAIT).await;
        assert_eq!(event.status, JobStatus::Error);
        assert!(event
            .error_message
            .unwrap()
            .contains("Upload of the processed file failed"));
    }

    #[tokio::test]
    async fn metadata_only_job_completes_without_processing() {
        let service = TestService::new(COPY_TRANSFORM).unwrap();
        let metadata = job_metadata_json("img.png", "ENCRYPT", "AES-256-CBC");
        service
            .orchestrator
            .handle_chunk(first_chunk_message("job-h", 0, &metadata))
            .await
            .unwrap();

        let event = service.wait_for_terminal("job-h", TERMINAL_WAIT).await;
        assert_eq!(event.status, JobStatus::Done);
        assert!(event.artifact_id.is_none());
        // no RUNNING announcement, nothing processed or finalized
        assert_eq!(service.events_for("job-h").len(), 1);
        assert_eq!(service.catalog.finalized_uploads(), 0);
        assert!(service.orchestrator.registry().is_empty());
    }

    #[tokio::test]
    async fn live_subscriber_receives_running_then_done() {
        let service = TestService::new(COPY_TRANSFORM).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        service
            .sessions
            .register(JobId::from("job-i"), SubscriberHandle::new(tx));

        send_job(&service, "job-i", &[b"0123456789"], &[0]).await;
        service.wait_for_terminal("job-i", TERMINAL_WAIT).await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.status, JobStatus::Running);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.status, JobStatus::Done);
        assert!(second.download_url.is_some());
    }

    #[tokio::test]
    async fn traversal_job_id_is_rejected_before_touching_the_filesystem() {
        let service = TestService::new(COPY_TRANSFORM).unwrap();
        let metadata = job_metadata_json("img.png", "ENCRYPT", "AES-256-CBC");
        for bad_id in ["../escape", "a/b", "nested\\id", "job-.."] {
            let result = service
                .orchestrator
                .handle_chunk(first_chunk_message(bad_id, 1, &metadata))
                .await;
            assert!(result.is_err(), "id {bad_id:?} was accepted");
        }
        assert!(service.orchestrator.registry().is_empty());
        // an id of `../escape` would have put the sink in the parent of
        // the working directory
        assert!(!service.temp_dir.path().join("escape_assembled.dat").exists());
        assert_eq!(service.catalog.jobs_created.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn dispatch_failure_removes_the_assembled_input() {
        let service = TestService::without_worker_pool(COPY_TRANSFORM).unwrap();
        let metadata = job_metadata_json("img.png", "ENCRYPT", "AES-256-CBC");
        service
            .orchestrator
            .handle_chunk(first_chunk_message("job-k", 1, &metadata))
            .await
            .unwrap();
        let result = service
            .orchestrator
            .handle_chunk(data_chunk_message("job-k", 0, 1, b"0123456789"))
            .await;
        assert!(result.is_err());
        assert!(!service.work_dir().join("job-k_assembled.dat").exists());
        assert!(service.orchestrator.registry().is_empty());
    }

    #[tokio::test]
    async fn delivery_error_force_fails_the_job() {
        let service = TestService::new(COPY_TRANSFORM).unwrap();
        // data before any metadata cannot be applied
        let result = service
            .orchestrator
            .handle_chunk(data_chunk_message("job-j", 0, 3, b"0123456789"))
            .await;
        assert!(result.is_err());

        service
            .orchestrator
            .force_fail(&JobId::from("job-j"), "Failed to apply a chunk message")
            .await;
        let event = service.wait_for_terminal("job-j", TERMINAL_WAIT).await;
        assert_eq!(event.status, JobStatus::Error);
        assert!(service.orchestrator.registry().is_empty());
    }
}
