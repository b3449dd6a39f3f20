//! Fixed export table for workspace documents.
//!
//! Live documents have no byte representation of their own; they are exported
//! once into a static format. The table is total over the kinds it lists and
//! anything else is skipped by the downloader.

/// Static format a workspace document kind is exported into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportFormat {
    pub content_type: &'static str,
    pub extension: &'static str,
}

const EXPORT_TABLE: &[(&str, ExportFormat)] = &[
    (
        "application/vnd.google-apps.document",
        ExportFormat {
            content_type: "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            extension: ".docx",
        },
    ),
    (
        "application/vnd.google-apps.spreadsheet",
        ExportFormat {
            content_type: "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            extension: ".xlsx",
        },
    ),
    (
        "application/vnd.google-apps.presentation",
        ExportFormat {
            content_type: "application/vnd.openxmlformats-officedocument.presentationml.presentation",
            extension: ".pptx",
        },
    ),
    (
        "application/vnd.google-apps.drawing",
        ExportFormat {
            content_type: "application/pdf",
            extension: ".pdf",
        },
    ),
    (
        "application/vnd.google-apps.script",
        ExportFormat {
            content_type: "application/json",
            extension: ".json",
        },
    ),
    (
        "application/vnd.google-apps.form",
        ExportFormat {
            content_type: "application/pdf",
            extension: ".pdf",
        },
    ),
];

/// Look up the export format for a workspace document kind.
pub fn export_format(mime_type: &str) -> Option<ExportFormat> {
    EXPORT_TABLE
        .iter()
        .find(|(kind, _)| *kind == mime_type)
        .map(|(_, format)| *format)
}

/// Every kind the table knows about.
pub fn exportable_kinds() -> impl Iterator<Item = &'static str> {
    EXPORT_TABLE.iter().map(|(kind, _)| *kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_kinds() {
        let doc = export_format("application/vnd.google-apps.document").unwrap();
        assert_eq!(doc.extension, ".docx");
        let drawing = export_format("application/vnd.google-apps.drawing").unwrap();
        assert_eq!(drawing.content_type, "application/pdf");
        assert_eq!(exportable_kinds().count(), 6);
    }

    #[test]
    fn test_unknown_kinds() {
        assert!(export_format("application/vnd.google-apps.site").is_none());
        assert!(export_format("application/vnd.google-apps.folder").is_none());
        assert!(export_format("text/plain").is_none());
    }
}
