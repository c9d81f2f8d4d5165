//! Plain text out of uploaded documents.

use crate::error::IngestError;
use docchat_core::chat::ChatFile;
use docchat_tools::html_to_text;
use std::path::Path;
use tracing::debug;

enum Format {
    Pdf,
    Html,
    Text,
}

fn format_of(file: &ChatFile) -> Format {
    let mime = file.mime_type.to_ascii_lowercase();
    let name = file.file_name.to_ascii_lowercase();
    if mime.contains("pdf") || name.ends_with(".pdf") {
        Format::Pdf
    } else if mime.contains("html") || name.ends_with(".html") || name.ends_with(".htm") {
        Format::Html
    } else {
        Format::Text
    }
}

fn clean_pdf_text(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Extract the text content of a stored file.
pub async fn extract_text(file: &ChatFile) -> Result<String, IngestError> {
    let path = Path::new(&file.path_name);
    let bytes = tokio::fs::read(path).await.map_err(|e| IngestError::io(path, e))?;

    let text = match format_of(file) {
        Format::Pdf => {
            let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
                .await
                .map_err(|e| IngestError::Extract(e.to_string()))?
                .map_err(|e| IngestError::Extract(e.to_string()))?;
            clean_pdf_text(&text)
        }
        Format::Html => html_to_text(&String::from_utf8_lossy(&bytes)),
        Format::Text => String::from_utf8_lossy(&bytes).into_owned(),
    };
    debug!(file_id = %file.id, chars = text.len(), "Extracted text");
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(dir: &tempfile::TempDir, name: &str, mime: &str, body: &str) -> ChatFile {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        ChatFile::new("c1", name, path.to_string_lossy(), mime)
    }

    #[tokio::test]
    async fn text_and_markdown_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let file = stored(&dir, "notes.md", "text/markdown", "# Title\n\nBody");
        assert_eq!(extract_text(&file).await.unwrap(), "# Title\n\nBody");
    }

    #[tokio::test]
    async fn html_is_reduced_to_text() {
        let dir = tempfile::tempdir().unwrap();
        let file = stored(&dir, "page.html", "text/html", "<p>One</p><script>x()</script><p>Two</p>");
        assert_eq!(extract_text(&file).await.unwrap(), "One\nTwo");
    }

    #[tokio::test]
    async fn unreadable_pdf_is_an_extraction_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = stored(&dir, "broken.pdf", "application/pdf", "not a pdf");
        assert!(matches!(extract_text(&file).await, Err(IngestError::Extract(_))));
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let file = ChatFile::new("c1", "gone.txt", "/nonexistent/gone.txt", "text/plain");
        assert!(matches!(extract_text(&file).await, Err(IngestError::Io { .. })));
    }

    #[test]
    fn pdf_text_is_trimmed_per_line() {
        assert_eq!(clean_pdf_text("  a  \n\n   \n b\n"), "a\nb");
    }
}
