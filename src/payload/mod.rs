//! # Application Layer Payloads
//!
//! The self-describing DIF/VIF record section of a telegram: DIF width and
//! function decoding, the VIF unit tables, and the record walker that turns
//! raw APL bytes into keyed [`DVEntry`](dvparser::DVEntry) values.

pub mod dif;
pub mod dvparser;
pub mod vif;

pub use dif::{dif_len_bytes, dif_measurement_type, DifWidth, MeasurementType};
pub use dvparser::{parse_dv, DVEntry, DifVifKey, DvEntries, DvParseResult};
pub use vif::{is_inside_vif_range, vif_scale, VifCombinable, VifRange};
