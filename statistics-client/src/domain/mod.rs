pub mod reading;
pub mod series;
pub mod stored_row;

pub use reading::{convert_native, Reading, Unit, UnitError};
pub use series::{cost_series_name, normalize_id, series_name, SeriesId, SERIES_ID_PREFIX};
pub use stored_row::StoredRow;
