//! Product folder template and file classification.
//!
//! Every product owns the tree
//! `{root}/{year}/{customer}/{project}/{serial}/{Photos,Docs,Test,Label,ProjectFiles}`
//! with `Photos/Thumbnails` and `ProjectFiles/{Drawings,Hydraulic,Electrical,Software}`
//! below it. Backends only supply the "ensure one folder" primitive; the shape
//! of the tree lives here.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};
use crate::sanitize::sanitize;

pub const PHOTOS: &str = "Photos";
pub const DOCS: &str = "Docs";
pub const TEST: &str = "Test";
pub const LABEL: &str = "Label";
pub const PROJECT_FILES: &str = "ProjectFiles";
pub const THUMBNAILS: &str = "Thumbnails";

pub const STANDARD_FOLDERS: [&str; 5] = [PHOTOS, DOCS, TEST, LABEL, PROJECT_FILES];
pub const PROJECT_FILE_FOLDERS: [&str; 4] = ["Drawings", "Hydraulic", "Electrical", "Software"];

/// Sub-folders created under the serial folder, each given as a path relative
/// to it. Parents always precede their children.
pub const PRODUCT_TREE: &[&[&str]] = &[
    &[PHOTOS],
    &[DOCS],
    &[TEST],
    &[LABEL],
    &[PROJECT_FILES],
    &[PHOTOS, THUMBNAILS],
    &[PROJECT_FILES, "Drawings"],
    &[PROJECT_FILES, "Hydraulic"],
    &[PROJECT_FILES, "Electrical"],
    &[PROJECT_FILES, "Software"],
];

/// Identifies one product's storage root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductFolderKey {
    pub year: i32,
    pub customer: String,
    pub project: String,
    pub serial: String,
}

impl ProductFolderKey {
    pub fn new(
        year: i32,
        customer: impl Into<String>,
        project: impl Into<String>,
        serial: impl Into<String>,
    ) -> Self {
        Self {
            year,
            customer: customer.into(),
            project: project.into(),
            serial: serial.into(),
        }
    }

    /// Sanitise every field, rejecting segments that end up unusable.
    pub fn sanitized(&self) -> StorageResult<SanitizedKey> {
        Ok(SanitizedKey {
            year: checked_segment("year", &self.year.to_string())?,
            customer: checked_segment("customer", &self.customer)?,
            project: checked_segment("project", &self.project)?,
            serial: checked_segment("serial", &self.serial)?,
        })
    }
}

/// A [`ProductFolderKey`] whose fields are all non-empty safe segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SanitizedKey {
    year: String,
    customer: String,
    project: String,
    serial: String,
}

impl SanitizedKey {
    /// Segments from the year down to the serial folder.
    pub fn segments(&self) -> [&str; 4] {
        [
            self.year.as_str(),
            self.customer.as_str(),
            self.project.as_str(),
            self.serial.as_str(),
        ]
    }
}

impl fmt::Display for SanitizedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments().join("/"))
    }
}

/// Sanitise a single segment and reject empty or relative names.
pub fn checked_segment(field: &str, value: &str) -> StorageResult<String> {
    let segment = sanitize(value);
    if segment.is_empty() || segment == "." || segment == ".." {
        return Err(StorageError::ValidationFailed(format!(
            "{field} {value:?} is not a usable folder or file name"
        )));
    }
    Ok(segment)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Photo,
    TestReport,
    Label,
    ProjectFile,
    #[default]
    Doc,
}

impl FileType {
    /// Parse the wire name. Unknown names fall back to [`FileType::Doc`].
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "photo" => FileType::Photo,
            "test_report" => FileType::TestReport,
            "label" => FileType::Label,
            "project_file" => FileType::ProjectFile,
            _ => FileType::Doc,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Photo => "photo",
            FileType::TestReport => "test_report",
            FileType::Label => "label",
            FileType::ProjectFile => "project_file",
            FileType::Doc => "doc",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileClassification {
    #[serde(rename = "type")]
    pub file_type: FileType,
    #[serde(default)]
    pub category: Option<String>,
}

impl FileClassification {
    pub fn new(file_type: FileType, category: Option<&str>) -> Self {
        Self {
            file_type,
            category: category.map(str::to_string),
        }
    }

    pub fn photo() -> Self {
        Self::new(FileType::Photo, None)
    }

    pub fn is_photo(&self) -> bool {
        self.file_type == FileType::Photo
    }

    /// Sanitised project-file category, if one was given and is non-blank.
    pub fn project_category(&self) -> Option<String> {
        if self.file_type != FileType::ProjectFile {
            return None;
        }
        self.category
            .as_deref()
            .map(sanitize)
            .filter(|c| !c.is_empty() && c != "." && c != "..")
    }

    /// Target folder relative to the serial folder.
    ///
    /// Project files without a category land directly in `ProjectFiles`.
    pub fn target_folder(&self) -> Vec<String> {
        match self.file_type {
            FileType::Photo => vec![PHOTOS.to_string()],
            FileType::TestReport => vec![TEST.to_string()],
            FileType::Label => vec![LABEL.to_string()],
            FileType::ProjectFile => match self.project_category() {
                Some(category) => vec![PROJECT_FILES.to_string(), category],
                None => vec![PROJECT_FILES.to_string()],
            },
            FileType::Doc => vec![DOCS.to_string()],
        }
    }
}

/// Relative location of thumbnails under the serial folder.
pub fn thumbnail_folder() -> [&'static str; 2] {
    [PHOTOS, THUMBNAILS]
}

/// Thumbnail file name: the sanitised name with its extension replaced by `.jpg`.
pub fn thumbnail_name(original_name: &str) -> String {
    let safe = sanitize(original_name);
    let base = match safe.rsplit_once('.') {
        Some((base, ext)) if !base.is_empty() && !ext.is_empty() => base,
        _ => safe.as_str(),
    };
    format!("{}.jpg", base)
}
