//! # Resource Catalog
//!
//! The REST resources served by the media manager, one worker unit each. Every resource
//! is mounted under `rest_api.path_prefix/rest_api.version`; notifications use the short
//! name as their topic.
//!
//! | Name                     | Resource               | Notifications                         |
//! |--------------------------|------------------------|---------------------------------------|
//! | `/images`                | [`CollectionResource`] | none                                  |
//! | `/importers`             | [`ImportersResource`]  | `import.started`, `import.completed`  |
//! | `/importers/images`      | [`CollectionResource`] | none                                  |
//! | `/storage/synchronizers` | [`CollectionResource`] | `synchronizer.created/updated/deleted`|
//! | `/tags`                  | [`CollectionResource`] | none                                  |
//! | `/tagger`                | [`CollectionResource`] | none                                  |

pub mod collection;
pub mod importers;

pub use collection::CollectionResource;
pub use importers::ImportersResource;

use api_workers::{ResourceDescriptor, ResourceRegistry};
use std::collections::BTreeMap;

use crate::config::RestApiConfig;

pub const IMAGES: &str = "/images";
pub const IMPORTERS: &str = "/importers";
pub const IMPORTERS_IMAGES: &str = "/importers/images";
pub const STORAGE_SYNCHRONIZERS: &str = "/storage/synchronizers";
pub const TAGS: &str = "/tags";
pub const TAGGER: &str = "/tagger";

pub const ALL: [&str; 6] = [
    IMAGES,
    IMPORTERS,
    IMPORTERS_IMAGES,
    STORAGE_SYNCHRONIZERS,
    TAGS,
    TAGGER,
];

/// Resource names mapped to their mounted descriptors.
pub type Catalog = BTreeMap<&'static str, ResourceDescriptor>;

/// Builds every resource and the registry that hosts them.
pub fn build(rest: &RestApiConfig) -> (ResourceRegistry, Catalog) {
    let catalog: Catalog = ALL
        .iter()
        .map(|name| (*name, ResourceDescriptor::new(rest.full_path(name))))
        .collect();
    let mount = |name: &str| catalog[name].clone();

    let registry = ResourceRegistry::new()
        .register(CollectionResource::new(mount(IMAGES), "image"))
        .register(ImportersResource::new(mount(IMPORTERS), IMPORTERS))
        .register(CollectionResource::new(mount(IMPORTERS_IMAGES), "image"))
        .register(
            CollectionResource::new(mount(STORAGE_SYNCHRONIZERS), "synchronizer")
                .with_notifications(STORAGE_SYNCHRONIZERS),
        )
        .register(CollectionResource::new(mount(TAGS), "tag"))
        .register(CollectionResource::new(mount(TAGGER), "tagger"));

    (registry, catalog)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_resource_is_mounted_under_the_api_prefix() {
        let (registry, catalog) = build(&RestApiConfig::default());
        assert_eq!(registry.len(), ALL.len());
        assert_eq!(catalog.len(), ALL.len());
        assert_eq!(
            catalog[IMPORTERS_IMAGES].full_path(),
            "/api/media-manager/v0/importers/images"
        );
        assert!(catalog
            .values()
            .all(|d| d.full_path().starts_with("/api/media-manager/v0/")));
    }
}
