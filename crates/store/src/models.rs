use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use serde::de::DeserializeOwned;

#[derive(sqlx::FromRow)]
pub(crate) struct EntryRow {
    pub key: String,
    value: String,
}

impl EntryRow {
    pub fn decode<V: DeserializeOwned>(&self) -> Result<V> {
        serde_json::from_str(&self.value).or_raise(|| ErrorKind::InvalidData(self.key.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_reports_key() {
        let row = EntryRow {
            key: "svc/v1/types/ab".to_string(),
            value: "\"drive\"".to_string(),
        };
        assert_eq!(row.decode::<String>().unwrap(), "drive");
        let err = row.decode::<u32>().unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidData(key) if key == "svc/v1/types/ab"));
    }
}
