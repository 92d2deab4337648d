//! Versioned on-disk layout of a user's library record.
//!
//! | Version | Layout |
//! |---------|--------|
//! | 0 | Bare JSON array of categories; local ids, statuses and dates may be missing |
//! | 1 | `{ schema_version?, next_local_id, categories }`; images have no `client_id` |
//! | 2 | Current: images carry a `client_id` |
//!
//! Older records are upgraded in one pass by [`migrate_record`] when loaded.
//! They are written back in the current layout on the next save.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use vitrine_core::{Category, Error, Library, Result, TransferStatus};

/// Version written by [`encode`].
pub const CURRENT_SCHEMA_VERSION: u64 = 2;

#[derive(Serialize)]
struct PersistedLibraryRef<'a> {
    schema_version: u64,
    next_local_id: u64,
    categories: &'a [Category],
}

#[derive(Deserialize)]
struct PersistedLibrary {
    #[serde(default)]
    next_local_id: u64,
    #[serde(default)]
    categories: Vec<Category>,
}

/// Serialize a snapshot in the current layout.
pub fn encode(library: &Library) -> Result<String> {
    let record = PersistedLibraryRef {
        schema_version: CURRENT_SCHEMA_VERSION,
        next_local_id: library.next_local_id,
        categories: &library.categories,
    };
    Ok(serde_json::to_string(&record)?)
}

/// Parse a stored record of any known version.
///
/// `uploading` statuses are reset to `pending`: a transfer that was running
/// when the record was written did not survive the restart.
pub fn decode(raw: &str) -> Result<Library> {
    let value: Value = serde_json::from_str(raw)?;
    let record: PersistedLibrary = serde_json::from_value(migrate_record(value)?)?;

    let mut library = Library {
        next_local_id: record.next_local_id,
        categories: record.categories,
    };
    for image in library
        .categories
        .iter_mut()
        .flat_map(|c| c.images.iter_mut())
    {
        if !image.transfer_status.is_terminal() {
            image.transfer_status = TransferStatus::Pending;
        }
    }
    Ok(library)
}

/// Upgrade a raw record to [`CURRENT_SCHEMA_VERSION`].
pub fn migrate_record(value: Value) -> Result<Value> {
    let mut record = match value {
        Value::Array(categories) => {
            let mut record = Map::new();
            record.insert("schema_version".into(), Value::from(0u64));
            record.insert("next_local_id".into(), Value::from(0u64));
            record.insert("categories".into(), Value::Array(categories));
            record
        }
        Value::Object(record) => record,
        other => {
            return Err(Error::Serialization(format!(
                "library record must be an object or array, got {}",
                json_kind(&other)
            )))
        }
    };

    let mut version = match record.get("schema_version") {
        None => 1,
        Some(v) => v.as_u64().ok_or_else(|| {
            Error::Serialization(format!("invalid schema_version: {}", v))
        })?,
    };
    if version > CURRENT_SCHEMA_VERSION {
        return Err(Error::Serialization(format!(
            "library record version {} is newer than supported version {}",
            version, CURRENT_SCHEMA_VERSION
        )));
    }

    if version == 0 {
        upgrade_v0(&mut record);
        version = 1;
    }
    if version == 1 {
        upgrade_v1(&mut record);
        version = 2;
    }

    record.insert("schema_version".into(), Value::from(version));
    Ok(Value::Object(record))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn categories_mut(record: &mut Map<String, Value>) -> impl Iterator<Item = &mut Map<String, Value>> {
    record
        .get_mut("categories")
        .and_then(Value::as_array_mut)
        .into_iter()
        .flat_map(|cats| cats.iter_mut())
        .filter_map(Value::as_object_mut)
}

fn images_mut(category: &mut Map<String, Value>) -> impl Iterator<Item = &mut Map<String, Value>> {
    category
        .get_mut("images")
        .and_then(Value::as_array_mut)
        .into_iter()
        .flat_map(|imgs| imgs.iter_mut())
        .filter_map(Value::as_object_mut)
}

/// v0 -> v1: assign missing local ids, backfill image status and date.
fn upgrade_v0(record: &mut Map<String, Value>) {
    let mut next_id = categories_mut(record)
        .filter_map(|c| c.get("local_id").and_then(Value::as_u64))
        .max()
        .unwrap_or(0)
        + 1;
    let now = Value::from(Utc::now().to_rfc3339());

    for category in categories_mut(record) {
        if category.get("local_id").and_then(Value::as_u64).is_none() {
            category.insert("local_id".into(), Value::from(next_id));
            next_id += 1;
        }
        for image in images_mut(category) {
            if !image.contains_key("transfer_status") {
                let status = if image
                    .get("remote_object_key")
                    .is_some_and(|k| !k.is_null())
                {
                    TransferStatus::Uploaded
                } else {
                    TransferStatus::Pending
                };
                image.insert("transfer_status".into(), Value::from(status.to_string()));
            }
            if !image.contains_key("date_added") {
                image.insert("date_added".into(), now.clone());
            }
        }
    }
    record.insert("next_local_id".into(), Value::from(next_id));
}

/// v1 -> v2: give every image a client id.
fn upgrade_v1(record: &mut Map<String, Value>) {
    for category in categories_mut(record) {
        for image in images_mut(category) {
            if !image.get("client_id").is_some_and(Value::is_string) {
                image.insert("client_id".into(), Value::from(Uuid::now_v7().to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vitrine_core::{BinaryRef, Image, NewCategory};

    #[test]
    fn test_encode_decode_preserves_library() {
        let mut lib = Library::new();
        let id = lib.push_category(NewCategory::new("Portraits").with_tags(vec!["bw".into()]));
        let mut image = Image::new(BinaryRef::inline(vec![1, 2, 3]), "profile");
        image.transfer_status = TransferStatus::Uploaded;
        lib.category_mut(id).unwrap().images.push(image);

        let raw = encode(&lib).unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["schema_version"], CURRENT_SCHEMA_VERSION);

        assert_eq!(decode(&raw).unwrap(), lib);
    }

    #[test]
    fn test_uploading_is_normalized_to_pending() {
        let mut lib = Library::new();
        let id = lib.push_category(NewCategory::new("A"));
        let mut image = Image::new(BinaryRef::inline(vec![9]), "x");
        image.transfer_status = TransferStatus::Uploading;
        lib.category_mut(id).unwrap().images.push(image);

        let loaded = decode(&encode(&lib).unwrap()).unwrap();
        assert_eq!(
            loaded.categories[0].images[0].transfer_status,
            TransferStatus::Pending
        );
    }

    #[test]
    fn test_v0_bare_array_is_upgraded() {
        let raw = json!([
            {
                "name": "Portraits",
                "remote_id": 10,
                "images": [
                    {
                        "binary": {"kind": "url", "url": "https://cdn/p/1.jpg"},
                        "pose_name": "one",
                        "remote_object_key": "p/1.jpg",
                        "remote_id": 100
                    },
                    {
                        "binary": {"kind": "inline", "data": "AQID"},
                        "pose_name": "two"
                    }
                ]
            },
            { "local_id": 4, "name": "Studio" }
        ])
        .to_string();

        let lib = decode(&raw).unwrap();
        assert_eq!(lib.categories.len(), 2);
        assert_eq!(lib.categories[0].local_id.0, 5);
        assert_eq!(lib.categories[1].local_id.0, 4);
        assert_eq!(lib.next_local_id, 6);

        let images = &lib.categories[0].images;
        assert_eq!(images[0].transfer_status, TransferStatus::Uploaded);
        assert_eq!(images[1].transfer_status, TransferStatus::Pending);
        assert_ne!(images[0].client_id, images[1].client_id);
    }

    #[test]
    fn test_v1_record_gets_client_ids() {
        let raw = json!({
            "next_local_id": 2,
            "categories": [{
                "local_id": 1,
                "name": "A",
                "images": [{
                    "binary": {"kind": "inline", "data": "AQ=="},
                    "pose_name": "p",
                    "date_added": "2024-05-01T10:00:00Z",
                    "transfer_status": "failed"
                }]
            }]
        });

        let migrated = migrate_record(raw).unwrap();
        assert_eq!(migrated["schema_version"], 2);
        assert!(migrated["categories"][0]["images"][0]["client_id"].is_string());
    }

    #[test]
    fn test_migrate_is_stable_on_current_records() {
        let lib = Library::new();
        let value: Value = serde_json::from_str(&encode(&lib).unwrap()).unwrap();
        assert_eq!(migrate_record(value.clone()).unwrap(), value);
    }

    #[test]
    fn test_rejects_future_versions_and_scalars() {
        let err = migrate_record(json!({"schema_version": 99, "categories": []})).unwrap_err();
        assert!(err.to_string().contains("newer than supported"));

        let err = migrate_record(json!("nope")).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
