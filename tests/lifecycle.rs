//! End-to-end task lifecycle through `ConversionService`.
//!
//! External tools are pointed at binaries that do not exist so every
//! conversion exercises the built-in fallback strategies.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use uuid::Uuid;

use docconv::config::{ConverterSettings, ServiceConfig};
use docconv::converters::docx::read_paragraphs;
use docconv::converters::markdown_to_word::render;
use docconv::converters::pdf::{extract_text, write_text_pdf};
use docconv::converters::{ConversionRequest, Converter, ConverterDispatch, StyleConfig};
use docconv::error::{ConversionError, Error, TaskError, ValidationError};
use docconv::service::ConversionService;
use docconv::tasks::{ConversionType, Submission, TaskSnapshot, TaskStatus};

/// Maximum time any conversion is allowed to take before the test gives up.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const GRACE: Duration = Duration::from_millis(200);

fn config(dir: &TempDir) -> ServiceConfig {
    ServiceConfig {
        temp_dir: dir.path().join("temp"),
        logs_dir: dir.path().join("logs"),
        download_grace: GRACE,
        converters: ConverterSettings {
            pdf2docx_bin: "docconv-test-missing-pdf2docx".to_string(),
            pandoc_bin: "docconv-test-missing-pandoc".to_string(),
            soffice_bin: "docconv-test-missing-soffice".to_string(),
            pdftotext_bin: "docconv-test-missing-pdftotext".to_string(),
            tool_timeout: Duration::from_secs(5),
        },
        ..ServiceConfig::default()
    }
}

async fn service(dir: &TempDir) -> ConversionService {
    let service = ConversionService::new(config(dir));
    service.init().await.unwrap();
    service
}

fn submission(conversion_type: &str, file_name: &str, content: Vec<u8>) -> Submission {
    Submission {
        conversion_type: conversion_type.to_string(),
        file_name: file_name.to_string(),
        content,
        style: None,
    }
}

/// Poll until the task reaches a terminal state.
async fn wait_terminal(service: &ConversionService, id: Uuid) -> TaskSnapshot {
    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            let snapshot = service.status(id).unwrap();
            if snapshot.status.is_terminal() {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("task did not finish in time")
}

fn report_pdf(paragraphs: usize) -> Vec<u8> {
    let text: Vec<String> = (0..paragraphs)
        .map(|i| format!("Paragraph {i} of the quarterly report."))
        .collect();
    write_text_pdf(&text).unwrap()
}

fn workspace_entries(root: &Path) -> usize {
    std::fs::read_dir(root).map(|rd| rd.count()).unwrap_or(0)
}

#[tokio::test]
async fn pdf_to_word_download_then_reclaim() {
    let dir = TempDir::new().unwrap();
    let service = service(&dir).await;

    let id = service
        .submit(submission("pdf-to-word", "report.pdf", report_pdf(3000)))
        .await
        .unwrap();
    let snapshot = wait_terminal(&service, id).await;
    assert_eq!(snapshot.status, TaskStatus::Completed, "{:?}", snapshot.error);
    assert_eq!(snapshot.progress, 100);
    assert!(snapshot.degraded);
    let output_name = snapshot.output_filename.unwrap();
    assert!(output_name.starts_with("report_") && output_name.ends_with(".docx"));

    let download = service.download(id).await.unwrap();
    assert_eq!(download.file_name, output_name);
    assert_eq!(
        download.content_type,
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
    );
    let text = read_paragraphs(&download.bytes).unwrap().join("\n");
    assert!(text.contains("Paragraph 17 of the quarterly report."));
    assert!(text.contains("Paragraph 2999 of the quarterly report."));

    // A second download inside the grace window still works.
    let again = service.download(id).await.unwrap();
    assert_eq!(again.bytes, download.bytes);

    tokio::time::sleep(GRACE * 3).await;
    assert!(matches!(service.status(id), Err(TaskError::NotFound { .. })));
    assert!(matches!(
        service.download(id).await,
        Err(Error::Task(TaskError::NotFound { .. }))
    ));
    assert!(!dir.path().join("temp").join(id.to_string()).exists());
}

#[tokio::test]
async fn markdown_to_word_falls_back_to_builtin_renderer() {
    let dir = TempDir::new().unwrap();
    let service = service(&dir).await;

    let markdown = "# Title\n\nSome **bold** text.\n\n- first\n- second\n";
    let id = service
        .submit(submission("markdown-to-word", "notes.md", markdown.as_bytes().to_vec()))
        .await
        .unwrap();
    let snapshot = wait_terminal(&service, id).await;
    assert_eq!(snapshot.status, TaskStatus::Completed, "{:?}", snapshot.error);
    assert!(snapshot.degraded);

    let download = service.download(id).await.unwrap();
    let paragraphs = read_paragraphs(&download.bytes).unwrap();
    assert!(paragraphs.iter().any(|p| p == "Title"));
    assert!(paragraphs.iter().any(|p| p == "Some bold text."));
    assert!(paragraphs.iter().any(|p| p.contains("second")));
}

#[tokio::test]
async fn word_to_pdf_and_pdf_to_markdown() {
    let dir = TempDir::new().unwrap();
    let service = service(&dir).await;

    let docx = render("# Memo\n\nShip the release on Friday.\n", &StyleConfig::default())
        .to_bytes(&StyleConfig::default())
        .unwrap();
    let id = service
        .submit(submission("word-to-pdf", "memo.docx", docx))
        .await
        .unwrap();
    let snapshot = wait_terminal(&service, id).await;
    assert_eq!(snapshot.status, TaskStatus::Completed, "{:?}", snapshot.error);
    let pdf = service.download(id).await.unwrap();
    assert_eq!(pdf.content_type, "application/pdf");
    assert!(pdf.bytes.starts_with(b"%PDF-"));
    let text = extract_text(&pdf.bytes).unwrap().join("\n");
    assert!(text.contains("Ship the release on Friday."));

    let id = service
        .submit(submission("pdf-to-markdown", "memo.pdf", pdf.bytes))
        .await
        .unwrap();
    let snapshot = wait_terminal(&service, id).await;
    assert_eq!(snapshot.status, TaskStatus::Completed, "{:?}", snapshot.error);
    let markdown = service.download(id).await.unwrap();
    assert!(markdown.file_name.ends_with(".md"));
    let markdown = String::from_utf8(markdown.bytes).unwrap();
    assert!(markdown.contains("Ship the release on Friday."));
}

#[tokio::test]
async fn rejected_uploads_create_nothing() {
    let dir = TempDir::new().unwrap();
    let service = service(&dir).await;
    let root = dir.path().join("temp");

    let unknown = service
        .submit(submission("pdf-to-excel", "report.pdf", b"%PDF-1.4".to_vec()))
        .await;
    assert!(matches!(
        unknown,
        Err(Error::Validation(ValidationError::UnknownType(_)))
    ));

    let wrong_extension = service
        .submit(submission("pdf-to-word", "report.txt", b"hello".to_vec()))
        .await;
    assert!(matches!(
        wrong_extension,
        Err(Error::Validation(ValidationError::UnsupportedExtension { .. }))
    ));

    let empty = service
        .submit(submission("pdf-to-word", "report.pdf", Vec::new()))
        .await;
    assert!(matches!(empty, Err(Error::Validation(ValidationError::EmptyFile))));

    assert_eq!(workspace_entries(&root), 0);
    assert!(service.tasks().is_empty());
}

#[tokio::test]
async fn concurrent_tasks_are_independent() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(service(&dir).await);

    let mut ids = Vec::new();
    for i in 0..6 {
        let markdown = format!("# Document {i}\n\nBody of document {i}.\n");
        let id = service
            .submit(submission("markdown-to-word", "same-name.md", markdown.into_bytes()))
            .await
            .unwrap();
        ids.push(id);
    }

    let mut names = std::collections::HashSet::new();
    for (i, id) in ids.iter().enumerate() {
        let snapshot = wait_terminal(&service, *id).await;
        assert_eq!(snapshot.status, TaskStatus::Completed);
        let download = service.download(*id).await.unwrap();
        let paragraphs = read_paragraphs(&download.bytes).unwrap();
        assert!(paragraphs.contains(&format!("Body of document {i}.")));
        names.insert(download.file_name);
    }
    assert_eq!(names.len(), ids.len());
}

struct Broken;

#[async_trait]
impl Converter for Broken {
    fn name(&self) -> &str {
        "broken"
    }
    async fn convert(&self, _request: &ConversionRequest<'_>) -> Result<(), ConversionError> {
        Err(ConversionError::InvalidInput("corrupt document".to_string()))
    }
}

struct Slow;

#[async_trait]
impl Converter for Slow {
    fn name(&self) -> &str {
        "slow"
    }
    async fn convert(&self, request: &ConversionRequest<'_>) -> Result<(), ConversionError> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        tokio::fs::write(request.output, b"done").await?;
        Ok(())
    }
}

#[tokio::test]
async fn failed_task_reports_error_and_can_be_discarded() {
    let dir = TempDir::new().unwrap();
    let mut dispatch = ConverterDispatch::new();
    dispatch
        .register(ConversionType::PdfToWord, || Box::new(Broken))
        .with_fallback(ConversionType::PdfToWord, || Box::new(Broken));
    let service = ConversionService::with_dispatch(config(&dir), dispatch);
    service.init().await.unwrap();

    let id = service
        .submit(submission("pdf-to-word", "report.pdf", b"%PDF-1.4".to_vec()))
        .await
        .unwrap();
    let snapshot = wait_terminal(&service, id).await;
    assert_eq!(snapshot.status, TaskStatus::Failed);
    let message = snapshot.error.unwrap();
    assert!(message.contains("corrupt document"), "{message}");
    assert!(!message.contains(dir.path().to_str().unwrap()));

    assert!(matches!(
        service.download(id).await,
        Err(Error::Task(TaskError::NotReady { .. }))
    ));

    service.discard(id).await.unwrap();
    assert!(matches!(service.status(id), Err(TaskError::NotFound { .. })));
    assert!(!dir.path().join("temp").join(id.to_string()).exists());

    // Reclaiming twice is harmless.
    assert!(matches!(
        service.discard(id).await,
        Err(TaskError::NotFound { .. })
    ));
}

#[tokio::test]
async fn running_task_cannot_be_discarded() {
    let dir = TempDir::new().unwrap();
    let mut dispatch = ConverterDispatch::new();
    dispatch.register(ConversionType::PdfToWord, || Box::new(Slow));
    let service = ConversionService::with_dispatch(config(&dir), dispatch);
    service.init().await.unwrap();

    let id = service
        .submit(submission("pdf-to-word", "report.pdf", b"%PDF-1.4".to_vec()))
        .await
        .unwrap();
    assert!(matches!(
        service.discard(id).await,
        Err(TaskError::StillActive { .. })
    ));

    let snapshot = wait_terminal(&service, id).await;
    assert_eq!(snapshot.status, TaskStatus::Completed);
    assert!(!snapshot.degraded);
    service.discard(id).await.unwrap();
    assert!(service.tasks().is_empty());
}

#[tokio::test]
async fn startup_sweep_removes_orphaned_workspaces() {
    let dir = TempDir::new().unwrap();
    let orphan = dir.path().join("temp").join(Uuid::new_v4().to_string());
    std::fs::create_dir_all(&orphan).unwrap();
    std::fs::write(orphan.join("input.pdf"), b"%PDF-1.4").unwrap();

    let service = ConversionService::new(ServiceConfig {
        stale_max_age: Duration::ZERO,
        ..config(&dir)
    });
    let report = service.init().await.unwrap();
    assert_eq!(report.workspaces, 1);
    assert!(!orphan.exists());
}
