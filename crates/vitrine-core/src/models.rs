//! Gallery data model: categories, images, and the library snapshot.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Primary key assigned by the remote metadata store.
pub type RemoteId = i64;

/// Identifier assigned to a category by the local store.
///
/// Monotonic within a library and never reused, even after deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(pub u64);

impl std::fmt::Display for LocalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// TRANSFER STATUS
// =============================================================================

/// Per-image upload state.
///
/// `Pending -> Uploading -> Uploaded`, or `Pending/Uploading -> Failed`.
/// `Uploading` is a UI courtesy state and is normalized back to `Pending`
/// when a library is loaded from disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    #[default]
    Pending,
    Uploading,
    Uploaded,
    Failed,
}

impl TransferStatus {
    /// Terminal states are the only ones treated as authoritative on disk.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Uploaded | Self::Failed)
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Uploading => write!(f, "uploading"),
            Self::Uploaded => write!(f, "uploaded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for TransferStatus {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "uploading" => Ok(Self::Uploading),
            "uploaded" => Ok(Self::Uploaded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid transfer status: {}", s)),
        }
    }
}

// =============================================================================
// BINARY REFERENCE
// =============================================================================

/// Where an image's bytes live on this device.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BinaryRef {
    /// Bytes held in the library record itself.
    Inline {
        #[serde(with = "base64_bytes")]
        data: Arc<[u8]>,
    },
    /// Bytes cached in a local file.
    File { path: PathBuf },
    /// Unauthenticated public URL, used when retrieval from storage failed.
    Url { url: String },
}

impl BinaryRef {
    pub fn inline(data: impl Into<Vec<u8>>) -> Self {
        Self::Inline {
            data: Arc::from(data.into()),
        }
    }

    /// Whether the bytes are available locally without a network round-trip.
    pub fn is_local(&self) -> bool {
        !matches!(self, Self::Url { .. })
    }
}

impl std::fmt::Debug for BinaryRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inline { data } => write!(f, "Inline({} bytes)", data.len()),
            Self::File { path } => write!(f, "File({})", path.display()),
            Self::Url { url } => write!(f, "Url({})", url),
        }
    }
}

mod base64_bytes {
    use std::sync::Arc;

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Arc<[u8]>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Arc<[u8]>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Arc::from)
            .map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// IMAGE
// =============================================================================

/// A single photo and its metadata.
///
/// Position inside the owning category's `images` is the UI's ordinal index
/// and is not an identity. Engine code addresses images by `client_id`,
/// `remote_id` or `remote_object_key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    /// Stable device-side identity, assigned at creation.
    pub client_id: Uuid,
    pub binary: BinaryRef,
    pub pose_name: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_favorite: bool,
    pub date_added: DateTime<Utc>,
    /// Set once the binary transfer has completed.
    #[serde(default)]
    pub remote_object_key: Option<String>,
    /// Set once the metadata record exists remotely; may lag the object key.
    #[serde(default)]
    pub remote_id: Option<RemoteId>,
    #[serde(default)]
    pub transfer_status: TransferStatus,
    #[serde(default)]
    pub size_bytes: u64,
}

impl Image {
    /// Create a new local image awaiting upload.
    pub fn new(binary: BinaryRef, pose_name: impl Into<String>) -> Self {
        let size_bytes = match &binary {
            BinaryRef::Inline { data } => data.len() as u64,
            _ => 0,
        };
        Self {
            client_id: Uuid::now_v7(),
            binary,
            pose_name: pose_name.into(),
            notes: String::new(),
            tags: Vec::new(),
            is_favorite: false,
            date_added: Utc::now(),
            remote_object_key: None,
            remote_id: None,
            transfer_status: TransferStatus::Pending,
            size_bytes,
        }
    }

    /// Never seen by the remote store.
    pub fn is_local_only(&self) -> bool {
        self.remote_id.is_none()
    }

    /// Binary is stored remotely but the metadata record is still missing.
    pub fn awaits_record(&self) -> bool {
        self.remote_object_key.is_some() && self.remote_id.is_none()
    }

    /// Whether the retry sweep should pick this image up.
    pub fn needs_upload_work(&self) -> bool {
        self.transfer_status != TransferStatus::Uploaded || self.awaits_record()
    }
}

/// Partial update of an image's user-editable fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pose_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_favorite: Option<bool>,
}

impl ImageUpdate {
    pub fn is_empty(&self) -> bool {
        self.pose_name.is_none()
            && self.notes.is_none()
            && self.tags.is_none()
            && self.is_favorite.is_none()
    }

    /// Apply to an image. Returns whether anything changed.
    pub fn apply(&self, image: &mut Image) -> bool {
        let mut changed = false;
        if let Some(ref v) = self.pose_name {
            changed |= replace_if_different(&mut image.pose_name, v.clone());
        }
        if let Some(ref v) = self.notes {
            changed |= replace_if_different(&mut image.notes, v.clone());
        }
        if let Some(ref v) = self.tags {
            changed |= replace_if_different(&mut image.tags, v.clone());
        }
        if let Some(v) = self.is_favorite {
            changed |= replace_if_different(&mut image.is_favorite, v);
        }
        changed
    }
}

// =============================================================================
// CATEGORY
// =============================================================================

/// A named gallery owning an ordered sequence of images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub local_id: LocalId,
    pub name: String,
    #[serde(default)]
    pub cover_image: Option<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_favorite: bool,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub private_password_hash: Option<String>,
    #[serde(default)]
    pub remote_id: Option<RemoteId>,
    #[serde(default)]
    pub images: Vec<Image>,
}

impl Category {
    /// Never seen by the remote store.
    pub fn is_local_only(&self) -> bool {
        self.remote_id.is_none()
    }
}

/// Fields for creating a category.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewCategory {
    pub name: String,
    pub cover_image: Option<String>,
    pub notes: String,
    pub tags: Vec<String>,
    pub is_favorite: bool,
    pub is_private: bool,
    pub private_password_hash: Option<String>,
}

impl NewCategory {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn private(mut self, password_hash: impl Into<String>) -> Self {
        self.is_private = true;
        self.private_password_hash = Some(password_hash.into());
        self
    }

    pub(crate) fn into_category(self, local_id: LocalId) -> Category {
        Category {
            local_id,
            name: self.name,
            cover_image: self.cover_image,
            notes: self.notes,
            tags: self.tags,
            is_favorite: self.is_favorite,
            is_private: self.is_private,
            private_password_hash: self.private_password_hash,
            remote_id: None,
            images: Vec::new(),
        }
    }
}

/// Partial update of a category's user-editable fields.
///
/// `Option<Option<_>>` fields distinguish "leave unchanged" (`None`) from
/// "clear" (`Some(None)`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover_image: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_favorite: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_private: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_password_hash: Option<Option<String>>,
}

impl CategoryUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.cover_image.is_none()
            && self.notes.is_none()
            && self.tags.is_none()
            && self.is_favorite.is_none()
            && self.is_private.is_none()
            && self.private_password_hash.is_none()
    }

    /// Apply to a category. Returns whether anything changed.
    pub fn apply(&self, category: &mut Category) -> bool {
        let mut changed = false;
        if let Some(ref v) = self.name {
            changed |= replace_if_different(&mut category.name, v.clone());
        }
        if let Some(ref v) = self.cover_image {
            changed |= replace_if_different(&mut category.cover_image, v.clone());
        }
        if let Some(ref v) = self.notes {
            changed |= replace_if_different(&mut category.notes, v.clone());
        }
        if let Some(ref v) = self.tags {
            changed |= replace_if_different(&mut category.tags, v.clone());
        }
        if let Some(v) = self.is_favorite {
            changed |= replace_if_different(&mut category.is_favorite, v);
        }
        if let Some(v) = self.is_private {
            changed |= replace_if_different(&mut category.is_private, v);
        }
        if let Some(ref v) = self.private_password_hash {
            changed |= replace_if_different(&mut category.private_password_hash, v.clone());
        }
        changed
    }
}

fn replace_if_different<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

// =============================================================================
// LIBRARY SNAPSHOT
// =============================================================================

/// The full set of categories for one user, plus the local id counter.
///
/// Instances are treated as immutable snapshots: mutations clone, modify and
/// replace the whole value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Library {
    pub next_local_id: u64,
    pub categories: Vec<Category>,
}

impl Library {
    pub fn new() -> Self {
        Self {
            next_local_id: 1,
            categories: Vec::new(),
        }
    }

    /// Reserve the next local id.
    pub fn allocate_id(&mut self) -> LocalId {
        let floor = self
            .categories
            .iter()
            .map(|c| c.local_id.0 + 1)
            .max()
            .unwrap_or(1);
        let id = self.next_local_id.max(floor);
        self.next_local_id = id + 1;
        LocalId(id)
    }

    /// Append a new category and return its id.
    pub fn push_category(&mut self, new: NewCategory) -> LocalId {
        let id = self.allocate_id();
        self.categories.push(new.into_category(id));
        id
    }

    pub fn category(&self, id: LocalId) -> Option<&Category> {
        self.categories.iter().find(|c| c.local_id == id)
    }

    pub fn category_mut(&mut self, id: LocalId) -> Option<&mut Category> {
        self.categories.iter_mut().find(|c| c.local_id == id)
    }

    pub fn category_by_remote_id(&self, remote_id: RemoteId) -> Option<&Category> {
        self.categories
            .iter()
            .find(|c| c.remote_id == Some(remote_id))
    }

    /// Locate an image by client id, returning the owning category too.
    pub fn find_image(&self, client_id: Uuid) -> Option<(&Category, &Image)> {
        self.categories.iter().find_map(|c| {
            c.images
                .iter()
                .find(|i| i.client_id == client_id)
                .map(|i| (c, i))
        })
    }

    pub fn find_image_mut(&mut self, client_id: Uuid) -> Option<&mut Image> {
        self.categories
            .iter_mut()
            .flat_map(|c| c.images.iter_mut())
            .find(|i| i.client_id == client_id)
    }

    pub fn image_count(&self) -> usize {
        self.categories.iter().map(|c| c.images.len()).sum()
    }

    /// True when no category holds any image (fresh device).
    pub fn has_no_images(&self) -> bool {
        self.categories.iter().all(|c| c.images.is_empty())
    }
}

// =============================================================================
// REMOTE RECORDS
// =============================================================================

/// Live (non-deleted) category row from the remote metadata store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCategory {
    pub id: RemoteId,
    pub name: String,
    #[serde(default)]
    pub cover_image: Option<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_favorite: bool,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub password_hash: Option<String>,
}

/// Live (non-deleted) image row from the remote metadata store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteImage {
    pub id: RemoteId,
    pub category_id: RemoteId,
    pub object_key: String,
    pub pose_name: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_favorite: bool,
    #[serde(default)]
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
}

/// Request for creating a category row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRemoteCategory {
    pub name: String,
    pub cover_image: Option<String>,
    pub notes: String,
    pub tags: Vec<String>,
    pub is_favorite: bool,
    pub is_private: bool,
    pub password_hash: Option<String>,
}

impl From<&Category> for NewRemoteCategory {
    fn from(c: &Category) -> Self {
        Self {
            name: c.name.clone(),
            cover_image: c.cover_image.clone(),
            notes: c.notes.clone(),
            tags: c.tags.clone(),
            is_favorite: c.is_favorite,
            is_private: c.is_private,
            password_hash: c.private_password_hash.clone(),
        }
    }
}

/// Request for creating an image row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRemoteImage {
    pub object_key: String,
    pub pose_name: String,
    pub notes: String,
    pub tags: Vec<String>,
    pub is_favorite: bool,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
}

impl NewRemoteImage {
    pub fn from_image(image: &Image, object_key: impl Into<String>) -> Self {
        Self {
            object_key: object_key.into(),
            pose_name: image.pose_name.clone(),
            notes: image.notes.clone(),
            tags: image.tags.clone(),
            is_favorite: image.is_favorite,
            size_bytes: image.size_bytes as i64,
            created_at: image.date_added,
        }
    }
}

/// Result of a successful object storage upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub key: String,
    pub size: u64,
}
