//! Spreadsheet export of a ranked result set with embedded thumbnails.

use std::path::{Path, PathBuf};

use rust_xlsxwriter::{Format, Image, Workbook, Worksheet, XlsxError};
use serde::Serialize;
use tracing::{error, info, warn};
use trendscan_core::{format_duration, Thumbnail, VideoRecord};
use trendscan_storage::resolve_static_path;

pub const HEADERS: [&str; 9] = [
    "Title", "URL", "Channel", "Views", "Duration", "Likes", "Comments", "Date", "Thumbnail",
];
const COLUMN_WIDTHS: [f64; 9] = [50.0, 40.0, 25.0, 10.0, 15.0, 10.0, 10.0, 15.0, 20.0];
const THUMBNAIL_COLUMN: u16 = 8;

// 16:9 at a fixed on-sheet size; rows grow to fit.
const IMAGE_WIDTH_PX: f64 = 120.0;
const IMAGE_HEIGHT_PX: f64 = 67.5;
const IMAGE_ROW_HEIGHT: f64 = 55.0;

pub const PLACEHOLDER_NONE: &str = "N/A";
pub const PLACEHOLDER_MISSING: &str = "Not Found";
pub const PLACEHOLDER_ERROR: &str = "Error: Image";

/// Display-ready projection of a [`VideoRecord`], built on demand per export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportRow {
    pub title: String,
    pub url: String,
    pub channel: String,
    pub views: u64,
    pub duration: String,
    pub likes: u64,
    pub comments: u64,
    pub date: String,
    pub engagement_score: u64,
}

impl ExportRow {
    pub fn from_record(record: &VideoRecord) -> Self {
        Self {
            title: record.title.clone(),
            url: record.url.clone(),
            channel: record.channel_name.clone(),
            views: record.views,
            duration: format_duration(record.duration_seconds),
            likes: record.likes,
            comments: record.comments,
            date: record.formatted_date.clone(),
            engagement_score: record.engagement_score(),
        }
    }
}

/// What goes into a row's thumbnail cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThumbnailCell {
    Image(PathBuf),
    Placeholder(&'static str),
}

pub fn thumbnail_cell(thumbnail: &Thumbnail, static_root: &Path) -> ThumbnailCell {
    let Some(relative) = thumbnail.local_path() else {
        return ThumbnailCell::Placeholder(PLACEHOLDER_NONE);
    };
    let path = resolve_static_path(static_root, relative);
    if path.is_file() {
        ThumbnailCell::Image(path)
    } else {
        ThumbnailCell::Placeholder(PLACEHOLDER_MISSING)
    }
}

#[derive(Debug, Clone)]
pub struct TabularExporter {
    static_root: PathBuf,
}

impl TabularExporter {
    pub fn new(static_root: impl Into<PathBuf>) -> Self {
        Self {
            static_root: static_root.into(),
        }
    }

    /// Write `records` to an xlsx file at `output`. Returns `None`, without
    /// creating a file, for an empty list; returns `None` on write failure.
    pub fn export(&self, records: &[VideoRecord], output: &Path) -> Option<PathBuf> {
        if records.is_empty() {
            warn!("no records to export");
            return None;
        }
        match self.write_workbook(records, output) {
            Ok(()) => {
                info!(path = %output.display(), rows = records.len(), "spreadsheet written");
                Some(output.to_path_buf())
            }
            Err(err) => {
                error!(path = %output.display(), error = %err, "spreadsheet export failed");
                None
            }
        }
    }

    fn write_workbook(&self, records: &[VideoRecord], output: &Path) -> Result<(), XlsxError> {
        let mut workbook = Workbook::new();
        let header = Format::new().set_bold();
        let sheet = workbook.add_worksheet();
        sheet.set_name("Videos")?;

        for (col, (name, width)) in HEADERS.iter().zip(COLUMN_WIDTHS).enumerate() {
            sheet.write_string_with_format(0, col as u16, *name, &header)?;
            sheet.set_column_width(col as u16, width)?;
        }

        for (i, record) in records.iter().enumerate() {
            let row = (i + 1) as u32;
            let export = ExportRow::from_record(record);
            sheet.write_string(row, 0, &export.title)?;
            sheet.write_string(row, 1, &export.url)?;
            sheet.write_string(row, 2, &export.channel)?;
            sheet.write_number(row, 3, export.views as f64)?;
            sheet.write_string(row, 4, &export.duration)?;
            sheet.write_number(row, 5, export.likes as f64)?;
            sheet.write_number(row, 6, export.comments as f64)?;
            sheet.write_string(row, 7, &export.date)?;
            self.write_thumbnail(sheet, row, record)?;
        }

        workbook.save(output)
    }

    fn write_thumbnail(
        &self,
        sheet: &mut Worksheet,
        row: u32,
        record: &VideoRecord,
    ) -> Result<(), XlsxError> {
        let path = match thumbnail_cell(&record.thumbnail, &self.static_root) {
            ThumbnailCell::Image(path) => path,
            ThumbnailCell::Placeholder(text) => {
                if text == PLACEHOLDER_MISSING {
                    warn!(title = %record.title, "thumbnail file not found");
                }
                sheet.write_string(row, THUMBNAIL_COLUMN, text)?;
                return Ok(());
            }
        };

        match Image::new(&path) {
            Ok(image) if image.width() > 0.0 && image.height() > 0.0 => {
                let scale_width = IMAGE_WIDTH_PX / image.width();
                let scale_height = IMAGE_HEIGHT_PX / image.height();
                let image = image.set_scale_width(scale_width).set_scale_height(scale_height);
                sheet.set_row_height(row, IMAGE_ROW_HEIGHT)?;
                sheet.insert_image(row, THUMBNAIL_COLUMN, &image)?;
            }
            Ok(_) => {
                warn!(path = %path.display(), "thumbnail has no dimensions");
                sheet.write_string(row, THUMBNAIL_COLUMN, PLACEHOLDER_ERROR)?;
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "thumbnail could not be embedded");
                sheet.write_string(row, THUMBNAIL_COLUMN, PLACEHOLDER_ERROR)?;
            }
        }
        Ok(())
    }
}
