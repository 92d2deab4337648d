//! Identifier hydration: link local-only entities to existing remote rows.
//!
//! Categories match by exact name, taking the first remote row with that
//! name that no local category is linked to yet. Images match by exact
//! object key. Entities that already have a remote id are left alone, so
//! running hydration twice changes nothing the second time.

use std::collections::HashSet;

use serde::Serialize;

use vitrine_core::{Library, RemoteCategory, RemoteId, RemoteImage};

/// Links established by one hydration pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HydrationReport {
    pub categories: usize,
    pub images: usize,
}

impl HydrationReport {
    pub fn is_empty(&self) -> bool {
        self.categories == 0 && self.images == 0
    }
}

/// Link local-only categories to remote categories by name.
pub fn hydrate_categories(library: &mut Library, remote: &[RemoteCategory]) -> usize {
    let mut claimed: HashSet<RemoteId> = library
        .categories
        .iter()
        .filter_map(|c| c.remote_id)
        .collect();

    let mut linked = 0;
    for category in library.categories.iter_mut().filter(|c| c.is_local_only()) {
        let found = remote
            .iter()
            .find(|r| r.name == category.name && !claimed.contains(&r.id));
        if let Some(r) = found {
            category.remote_id = Some(r.id);
            claimed.insert(r.id);
            linked += 1;
        }
    }
    linked
}

/// Link local images without a remote id to remote images by object key.
pub fn hydrate_images(library: &mut Library, remote: &[RemoteImage]) -> usize {
    let mut claimed: HashSet<RemoteId> = library
        .categories
        .iter()
        .flat_map(|c| c.images.iter())
        .filter_map(|i| i.remote_id)
        .collect();

    let mut linked = 0;
    for image in library
        .categories
        .iter_mut()
        .flat_map(|c| c.images.iter_mut())
        .filter(|i| i.is_local_only())
    {
        let Some(key) = image.remote_object_key.as_deref() else {
            continue;
        };
        let found = remote
            .iter()
            .find(|r| r.object_key == key && !claimed.contains(&r.id));
        if let Some(r) = found {
            image.remote_id = Some(r.id);
            claimed.insert(r.id);
            linked += 1;
        }
    }
    linked
}

/// Run both passes.
pub fn hydrate(
    library: &mut Library,
    categories: &[RemoteCategory],
    images: &[RemoteImage],
) -> HydrationReport {
    HydrationReport {
        categories: hydrate_categories(library, categories),
        images: hydrate_images(library, images),
    }
}
