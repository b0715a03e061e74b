use chrono::{DateTime, Utc};
use rust_xlsxwriter::{Format, Workbook, Worksheet};

use crate::error::{Error, Result};
use crate::models::{Attendee, Event};

/// Column titles shared by the CSV and XLSX exports.
pub const HEADERS: [&str; 9] = [
    "STT / No.",
    "Mã số / ID",
    "Họ tên / Name",
    "Email",
    "Điện thoại / Phone",
    "Đơn vị / Organization",
    "Trạng thái / Status",
    "Check-in (UTC)",
    "Check-out (UTC)",
];

/// Byte order mark so spreadsheet programs detect UTF-8.
const UTF8_BOM: char = '\u{feff}';

fn format_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

fn row(index: usize, attendee: &Attendee) -> [String; 9] {
    [
        (index + 1).to_string(),
        attendee.student_id.clone(),
        attendee.full_name.clone(),
        attendee.email.clone().unwrap_or_default(),
        attendee.phone.clone().unwrap_or_default(),
        attendee.organization.clone().unwrap_or_default(),
        attendee.status.label_vi().to_string(),
        format_time(attendee.checked_in_at),
        format_time(attendee.checked_out_at),
    ]
}

fn push_field(out: &mut String, value: &str) {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        out.push('"');
        out.push_str(&value.replace('"', "\"\""));
        out.push('"');
    } else {
        out.push_str(value);
    }
}

fn push_line<'a>(out: &mut String, fields: impl IntoIterator<Item = &'a str>) {
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        push_field(out, field);
    }
    out.push_str("\r\n");
}

/// Attendee list of an event as CSV.
///
/// Output starts with a UTF-8 byte order mark. Fields containing commas,
/// quotes or line breaks are quoted.
#[must_use]
pub fn to_csv(attendees: &[Attendee]) -> String {
    let mut csv = String::new();
    csv.push(UTF8_BOM);
    push_line(&mut csv, HEADERS);

    for (index, attendee) in attendees.iter().enumerate() {
        let fields = row(index, attendee);
        push_line(&mut csv, fields.iter().map(String::as_str));
    }
    csv
}

/// Attendee list of an event as an XLSX workbook.
///
/// # Errors
///
/// Returns [`Error::Export`] if the workbook cannot be written.
pub fn to_xlsx(event: &Event, attendees: &[Attendee]) -> Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    let mut worksheet = Worksheet::new();
    worksheet.set_name("Điểm danh").map_err(export_error)?;

    let bold = Format::new().set_bold();
    worksheet
        .write_string_with_format(0, 0, event.name.as_str(), &bold)
        .map_err(export_error)?;
    worksheet
        .write_string(1, 0, event.event_date.to_string().as_str())
        .map_err(export_error)?;

    let header_row = 3;
    for (col, title) in (0u16..).zip(HEADERS) {
        worksheet
            .write_string_with_format(header_row, col, title, &bold)
            .map_err(export_error)?;
    }

    for ((index, attendee), r) in attendees.iter().enumerate().zip(header_row + 1..) {
        for (col, value) in (0u16..).zip(row(index, attendee)) {
            if col == 0 {
                worksheet
                    .write_number(r, col, (index + 1) as f64)
                    .map_err(export_error)?;
            } else {
                worksheet
                    .write_string(r, col, value.as_str())
                    .map_err(export_error)?;
            }
        }
    }

    worksheet.set_column_width(2, 28.0).map_err(export_error)?;
    worksheet.set_column_width(3, 28.0).map_err(export_error)?;
    worksheet.set_column_width(6, 16.0).map_err(export_error)?;
    worksheet.set_column_width(7, 20.0).map_err(export_error)?;
    worksheet.set_column_width(8, 20.0).map_err(export_error)?;

    workbook.push_worksheet(worksheet);
    workbook.save_to_buffer().map_err(export_error)
}

fn export_error(err: rust_xlsxwriter::XlsxError) -> Error {
    Error::Export(err.to_string())
}

#[cfg(feature = "web")]
mod handler {
    use axum::extract::{Path, Query, State};
    use axum::http::header;
    use axum::response::{IntoResponse, Response};
    use axum::Extension;
    use serde::Deserialize;
    use tracing::info;

    use crate::app::SharedState;
    use crate::error::Result;
    use crate::login::CurrentUser;
    use crate::models::{AttendeeFilter, Permission};

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum ExportFormat {
        #[default]
        Csv,
        Xlsx,
    }

    #[derive(Debug, Default, Deserialize)]
    pub struct ExportParams {
        #[serde(default)]
        pub format: ExportFormat,
    }

    /// `GET /api/events/:event_id/export?format=csv|xlsx`
    pub async fn export(
        State(state): State<SharedState>,
        Extension(user): Extension<CurrentUser>,
        Path(event_id): Path<i64>,
        Query(params): Query<ExportParams>,
    ) -> Result<Response> {
        let (event, _) = state.authorize(user.id, event_id, Permission::View)?;
        let attendees = state
            .storage()
            .list_attendees(event_id, &AttendeeFilter::default())?;
        info!(event_id, count = attendees.len(), format = ?params.format, "Exporting attendees");

        let response = match params.format {
            ExportFormat::Csv => (
                [
                    (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                    (header::CONTENT_DISPOSITION, disposition(event_id, "csv")),
                ],
                super::to_csv(&attendees),
            )
                .into_response(),
            ExportFormat::Xlsx => (
                [
                    (
                        header::CONTENT_TYPE,
                        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
                            .to_string(),
                    ),
                    (header::CONTENT_DISPOSITION, disposition(event_id, "xlsx")),
                ],
                super::to_xlsx(&event, &attendees)?,
            )
                .into_response(),
        };
        Ok(response)
    }

    fn disposition(event_id: i64, extension: &str) -> String {
        format!("attachment; filename=\"attendance-event-{event_id}.{extension}\"")
    }
}

#[cfg(feature = "web")]
pub use handler::{export, ExportFormat, ExportParams};
