//! Type-tagged FITS key writing (spec.md §4.6: "All FITS key adds funnel
//! through a type-tagged `add_key`").

use crate::camera_info::{KeyValue, KeywordDb};
use crate::error::Result;

#[cfg(feature = "storage_fits")]
use fitsio::hdu::FitsHdu;
#[cfg(feature = "storage_fits")]
use fitsio::FitsFile;

/// Writes every entry of `db` into `hdu`, dispatching on the stored
/// [`KeyValue`] variant.
#[cfg(feature = "storage_fits")]
pub fn write_keys(fptr: &mut FitsFile, hdu: &mut FitsHdu, db: &KeywordDb) -> Result<()> {
    for (keyword, entry) in db.iter() {
        match &entry.value {
            KeyValue::Bool(v) => hdu.write_key(fptr, keyword, *v)?,
            KeyValue::Int(v) => hdu.write_key(fptr, keyword, *v)?,
            KeyValue::Long(v) => hdu.write_key(fptr, keyword, *v)?,
            KeyValue::Float(v) => hdu.write_key(fptr, keyword, *v)?,
            KeyValue::Double(v) => hdu.write_key(fptr, keyword, *v)?,
            KeyValue::String(v) => hdu.write_key(fptr, keyword, v.as_str())?,
        }
    }
    Ok(())
}

#[cfg(not(feature = "storage_fits"))]
pub fn write_keys(_db: &KeywordDb) -> Result<()> {
    Err(crate::error::ArchonError::FeatureNotEnabled(
        "storage_fits".to_string(),
    ))
}
