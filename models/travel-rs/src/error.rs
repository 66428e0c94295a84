use std::path::PathBuf;

use mrp::MrpError;

use crate::glm::FitError;

#[derive(Debug, thiserror::Error)]
pub enum TravelError {
    #[error("run environment: {0}")]
    Environment(#[from] MrpError),

    #[error("CSV error in {}: {source}", .path.display())]
    Csv { path: PathBuf, source: csv::Error },

    #[error("model fit failed: {0}")]
    Fit(#[from] FitError),

    #[error("missing input file `{0}` in model.files")]
    MissingFile(&'static str),

    #[error("model input section could not be read")]
    MissingInput,

    #[error("survey table is empty after joining with distances")]
    EmptyTable,

    #[error("invalid data: {message}")]
    Data { message: String },
}
