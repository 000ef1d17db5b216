use thiserror::Error;

#[derive(Error, Debug)]
pub enum PosmapError {
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Workbook read error: {0}")]
    XlsxRead(#[from] calamine::XlsxError),

    #[error("Workbook write error: {0}")]
    XlsxWrite(#[from] rust_xlsxwriter::XlsxError),

    #[error("Workbook package error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Workbook XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    NoInput(String),

    #[error("No usable header row: {0}")]
    NoHeaders(String),

    #[error("Template not found: {0}")]
    TemplateMissing(String),

    #[error("Remote service error: {0}")]
    Remote(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("{0}")]
    Other(String),
}

impl PosmapError {
    /// Required input missing or unusable. These abort a run; everything else
    /// is absorbed further up and surfaced through the report.
    pub fn is_input_shape(&self) -> bool {
        matches!(
            self,
            Self::NoInput(_) | Self::NoHeaders(_) | Self::TemplateMissing(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PosmapError>;
