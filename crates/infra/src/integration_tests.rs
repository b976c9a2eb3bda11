//! End-to-end tests for the assembled pipeline.
//!
//! Submission → queue → workers → converters → completion gate →
//! finalizer → bundle, with the in-memory store and queue and a real
//! staging area on disk.

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use docbatch_core::{ConversionKind, FileStatus, JobId, JobStatus};
    use docbatch_events::{InMemoryTaskQueue, TaskMessage, TaskQueue};

    use crate::config::PipelineConfig;
    use crate::conversion::docx::build_docx;
    use crate::conversion::{ConvertError, Converter, ConverterRegistry, OutputRef, StagedConverter};
    use crate::coordinator::Coordinator;
    use crate::finalizer::Finalizer;
    use crate::pipeline::Pipeline;
    use crate::retry::RetryPolicy;
    use crate::bundle::ZipBundler;
    use crate::staging::StagingArea;
    use crate::store::{InMemoryJobStore, JobStore};

    const WAIT: Duration = Duration::from_secs(10);
    const POLL: Duration = Duration::from_millis(10);

    fn config(root: &Path) -> PipelineConfig {
        PipelineConfig {
            storage_path: root.to_path_buf(),
            workers: 3,
            retry: RetryPolicy::fixed(3, Duration::ZERO),
            poll_interval: POLL,
            ..PipelineConfig::default()
        }
    }

    fn write_inputs(dir: &Path, files: &[(&str, Vec<u8>)]) -> Vec<PathBuf> {
        files
            .iter()
            .map(|(name, bytes)| {
                let path = dir.join(name);
                fs::write(&path, bytes).unwrap();
                path
            })
            .collect()
    }

    fn bundle_entries(staging: &StagingArea, download: &str) -> Vec<String> {
        let file = fs::File::open(staging.resolve(download).unwrap()).unwrap();
        let archive = zip::ZipArchive::new(file).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        names
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !done() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(POLL);
        }
    }

    #[test]
    fn mixed_batch_completes_with_partial_bundle() {
        let storage = tempfile::tempdir().unwrap();
        let inputs = tempfile::tempdir().unwrap();

        // flaky.docx fails transiently twice, then converts.
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut converters = ConverterRegistry::new();
        {
            let staging = Arc::new(StagingArea::open(storage.path()).unwrap());
            let real = StagedConverter::new(staging, ConversionKind::DocxToPdf);
            let attempts = attempts.clone();
            converters.register(
                ConversionKind::DocxToPdf,
                move |job_id: JobId, name: &str| -> Result<OutputRef, ConvertError> {
                    if name == "flaky.docx" && attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        return Err(ConvertError::transient("converter busy"));
                    }
                    real.convert(job_id, name)
                },
            );
        }

        let pipeline = Pipeline::builder(config(storage.path()))
            .with_converters(converters)
            .start()
            .unwrap();
        let paths = write_inputs(
            inputs.path(),
            &[
                ("report.docx", build_docx(&["Quarterly report", "All good."])),
                ("flaky.docx", build_docx(&["Eventually fine"])),
                ("broken.docx", b"not a zip archive".to_vec()),
            ],
        );

        let coordinator = pipeline.coordinator();
        let job_id = coordinator.submit_files(&paths).unwrap();
        let report = coordinator.wait(job_id, WAIT, POLL).unwrap();

        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!((report.completed_count, report.failed_count), (2, 1));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let flaky = report.files.iter().find(|f| f.name == "flaky.docx").unwrap();
        assert_eq!((flaky.status, flaky.attempt), (FileStatus::Completed, 3));
        let broken = report.files.iter().find(|f| f.name == "broken.docx").unwrap();
        assert_eq!((broken.status, broken.attempt), (FileStatus::Failed, 1));
        assert!(broken.error_message.is_some());

        let download = report.download.expect("bundle");
        assert_eq!(download, format!("output/{job_id}.zip"));
        assert_eq!(
            bundle_entries(pipeline.staging(), &download),
            vec!["flaky.pdf".to_string(), "report.pdf".to_string()]
        );

        let stats = pipeline.shutdown();
        assert_eq!(stats.retried, 2);
    }

    #[test]
    fn all_failed_batch_has_no_bundle() {
        let storage = tempfile::tempdir().unwrap();
        let inputs = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::start(config(storage.path())).unwrap();

        let paths = write_inputs(
            inputs.path(),
            &[
                ("a.docx", b"garbage".to_vec()),
                ("b.docx", b"more garbage".to_vec()),
            ],
        );
        let job_id = pipeline.coordinator().submit_files(&paths).unwrap();
        let report = pipeline.coordinator().wait(job_id, WAIT, POLL).unwrap();

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.failed_count, 2);
        assert!(report.download.is_none());
        assert!(!storage.path().join(format!("output/{job_id}.zip")).exists());
        pipeline.shutdown();
    }

    #[test]
    fn text_files_convert_too() {
        let storage = tempfile::tempdir().unwrap();
        let inputs = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::start(config(storage.path())).unwrap();

        let paths = write_inputs(inputs.path(), &[("notes.txt", b"first\n\nsecond\n".to_vec())]);
        let job_id = pipeline.coordinator().submit_files(&paths).unwrap();
        let report = pipeline.coordinator().wait(job_id, WAIT, POLL).unwrap();

        assert_eq!(report.status, JobStatus::Completed);
        let pdf = fs::read(storage.path().join(format!("output/{job_id}/notes.pdf"))).unwrap();
        assert!(pdf.starts_with(b"%PDF-"));
        pipeline.shutdown();
    }

    #[test]
    fn zero_file_job_fails() {
        let storage = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::start(config(storage.path())).unwrap();

        let job_id = pipeline.coordinator().submit(Vec::new()).unwrap();
        let report = pipeline.coordinator().job_report(job_id).unwrap();
        assert_eq!(report.status, JobStatus::Failed);
        assert!(report.files.is_empty());
        pipeline.shutdown();
    }

    #[test]
    fn archive_submission_converts_supported_entries() {
        let storage = tempfile::tempdir().unwrap();
        let inputs = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::start(config(storage.path())).unwrap();

        let archive_path = inputs.path().join("batch.zip");
        {
            let mut zip = zip::ZipWriter::new(fs::File::create(&archive_path).unwrap());
            let options = zip::write::SimpleFileOptions::default();
            zip.add_directory("docs/", options).unwrap();
            zip.start_file("docs/one.docx", options).unwrap();
            zip.write_all(&build_docx(&["one"])).unwrap();
            zip.start_file("two.docx", options).unwrap();
            zip.write_all(&build_docx(&["two"])).unwrap();
            zip.start_file("docs/.hidden.docx", options).unwrap();
            zip.write_all(b"ignored").unwrap();
            zip.start_file("picture.png", options).unwrap();
            zip.write_all(b"ignored").unwrap();
            zip.finish().unwrap();
        }

        let job_id = pipeline.coordinator().submit_archive(&archive_path).unwrap();
        let report = pipeline.coordinator().wait(job_id, WAIT, POLL).unwrap();

        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.file_count, 2);
        assert_eq!(
            bundle_entries(pipeline.staging(), &report.download.unwrap()),
            vec!["one.pdf".to_string(), "two.pdf".to_string()]
        );
        pipeline.shutdown();
    }

    #[test]
    fn deleted_job_is_never_finalized() {
        let storage = tempfile::tempdir().unwrap();
        let converted = Arc::new(AtomicUsize::new(0));
        let counter = converted.clone();
        let slow = ConverterRegistry::uniform(
            move |_: JobId, name: &str| -> Result<OutputRef, ConvertError> {
                thread::sleep(Duration::from_millis(50));
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(format!("{name}.pdf"))
            },
        );
        let pipeline = Pipeline::builder(config(storage.path()))
            .with_converters(slow)
            .start()
            .unwrap();
        let coordinator = pipeline.coordinator().clone();

        let names: Vec<String> = (0..6).map(|i| format!("{i}.docx")).collect();
        let job_id = coordinator.submit(names).unwrap();
        coordinator.delete_job(job_id).unwrap();

        // Let the workers drain whatever they had already picked up.
        thread::sleep(Duration::from_millis(300));
        let stats = pipeline.shutdown();

        assert!(coordinator.job_report(job_id).is_err());
        assert!(!coordinator.gate().is_open(job_id));
        assert!(!storage.path().join(format!("output/{job_id}.zip")).exists());
        assert_eq!(stats.completed, 0);
        assert!(stats.skipped as usize + converted.load(Ordering::SeqCst) >= 6);
    }

    #[test]
    fn redelivered_task_does_not_refinalize() {
        let storage = tempfile::tempdir().unwrap();
        let inputs = tempfile::tempdir().unwrap();
        let queue = Arc::new(InMemoryTaskQueue::new());
        let pipeline = Pipeline::builder(config(storage.path()))
            .with_queue(queue.clone())
            .start()
            .unwrap();

        let paths = write_inputs(inputs.path(), &[("a.txt", b"hello".to_vec())]);
        let job_id = pipeline.coordinator().submit_files(&paths).unwrap();
        let first = pipeline.coordinator().wait(job_id, WAIT, POLL).unwrap();
        assert_eq!(first.status, JobStatus::Completed);

        // A broker redelivering the original message after completion.
        queue
            .enqueue(TaskMessage::first_attempt(job_id, "a.txt", ConversionKind::TextToPdf))
            .unwrap();
        wait_until(|| pipeline.stats().skipped == 1);

        let again = pipeline.coordinator().job_report(job_id).unwrap();
        assert_eq!(again.status, JobStatus::Completed);
        assert_eq!(again.updated_at, first.updated_at);
        assert_eq!(again.files[0].attempt, 1);
        pipeline.shutdown();
    }

    #[test]
    fn restart_resumes_queued_work() {
        let storage = tempfile::tempdir().unwrap();
        let inputs = tempfile::tempdir().unwrap();
        let store = InMemoryJobStore::arc();
        let queue = Arc::new(InMemoryTaskQueue::new());

        // A process that submitted and died before any worker ran.
        let job_id = {
            let staging = Arc::new(StagingArea::open(storage.path()).unwrap());
            let finalizer = Finalizer::new(store.clone(), Arc::new(ZipBundler::new(staging.clone())));
            let coordinator =
                Coordinator::new(store.clone(), queue.clone(), finalizer).with_staging(staging);
            let paths = write_inputs(
                inputs.path(),
                &[("a.txt", b"a".to_vec()), ("b.txt", b"b".to_vec())],
            );
            coordinator.submit_files(&paths).unwrap()
        };
        assert_eq!(store.get_job(job_id).unwrap().status, JobStatus::InProgress);
        assert_eq!(queue.len(), 2);

        let pipeline = Pipeline::builder(config(storage.path()))
            .with_store(store.clone())
            .with_queue(queue.clone())
            .start()
            .unwrap();
        let report = pipeline.coordinator().wait(job_id, WAIT, POLL).unwrap();

        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.completed_count, 2);
        pipeline.shutdown();
    }

    #[test]
    fn status_process_leaves_tasks_to_the_serving_process() {
        let storage = tempfile::tempdir().unwrap();
        let inputs = tempfile::tempdir().unwrap();
        let store = InMemoryJobStore::arc();
        let queue = Arc::new(InMemoryTaskQueue::new());

        let inspector = Pipeline::builder(config(storage.path()))
            .with_store(store.clone())
            .with_queue(queue.clone())
            .open()
            .unwrap();
        let paths = write_inputs(
            inputs.path(),
            &[("a.txt", b"a".to_vec()), ("b.txt", b"b".to_vec())],
        );
        let job_id = inspector.coordinator().submit_files(&paths).unwrap();

        thread::sleep(Duration::from_millis(100));
        assert_eq!(queue.len(), 2);
        assert_eq!(inspector.stats(), Default::default());

        // The serving process adopts the job on recovery.
        let server = Pipeline::builder(config(storage.path()))
            .with_store(store.clone())
            .with_queue(queue.clone())
            .start()
            .unwrap();
        let report = inspector.coordinator().wait(job_id, WAIT, POLL).unwrap();
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.download, Some(format!("output/{job_id}.zip")));

        server.shutdown();
        assert_eq!(inspector.shutdown(), Default::default());
    }

    #[test]
    fn colliding_output_names_store_nothing() {
        let storage = tempfile::tempdir().unwrap();
        let inputs = tempfile::tempdir().unwrap();
        let store = InMemoryJobStore::arc();
        let pipeline = Pipeline::builder(config(storage.path()))
            .with_store(store.clone())
            .start()
            .unwrap();

        let paths = write_inputs(
            inputs.path(),
            &[("report.docx", build_docx(&["doc"])), ("report.txt", b"text".to_vec())],
        );
        let err = pipeline.coordinator().submit_files(&paths).unwrap_err();
        assert!(err.to_string().contains("report.pdf"), "{err}");

        for status in [JobStatus::Pending, JobStatus::InProgress, JobStatus::Completed, JobStatus::Failed] {
            assert!(store.list_jobs_by_status(status).unwrap().is_empty());
        }
        assert_eq!(fs::read_dir(storage.path().join("temp")).map(|d| d.count()).unwrap_or(0), 0);
        pipeline.shutdown();
    }
}
