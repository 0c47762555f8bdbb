//! Image resolution against locally available server images
//!
//! Tags follow `<repo>:<edition>-<version>[-<build>][-serverless][-columnar]`,
//! e.g. `couchbase/server:enterprise-7.6.0-2176-columnar`.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::runtime::ContainerRuntime;
use crate::deployment::Image;
use crate::error::{DeployError, Result};
use crate::image::{compare_image_defs, ImageDef, ImageRef};

#[async_trait]
pub trait ImageProvider: Send + Sync {
    async fn get_image(&self, def: &ImageDef) -> Result<ImageRef>;

    /// All known images, oldest first
    async fn list_images(&self) -> Result<Vec<Image>>;

    /// Images whose version is `version` or a release of it (`7.2` matches `7.2.3`)
    async fn search_images(&self, version: &str) -> Result<Vec<Image>>;

    async fn get_image_raw(&self, image_path: &str) -> Result<ImageRef>;
}

/// Parse the tag part of an image name into the definition it provides
pub fn parse_tag(tag: &str) -> Option<ImageDef> {
    let mut parts = tag.split('-');

    let use_community_edition = match parts.next()? {
        "enterprise" => false,
        "community" => true,
        _ => return None,
    };
    let version = parts.next().filter(|v| !v.is_empty())?;

    let mut def = ImageDef {
        version: version.to_string(),
        use_community_edition,
        ..Default::default()
    };
    for part in parts {
        match part {
            "serverless" => def.use_serverless = true,
            "columnar" => def.use_columnar = true,
            build if def.build_no == 0 => def.build_no = build.parse().ok()?,
            _ => return None,
        }
    }

    Some(def)
}

/// Image definition of a full image reference such as `repo:community-7.2.0`
pub fn image_def_for(image_path: &str) -> Option<ImageDef> {
    let (_, tag) = image_path.rsplit_once(':')?;
    parse_tag(tag)
}

pub fn tag_for(def: &ImageDef) -> String {
    let mut tag = if def.use_community_edition {
        format!("community-{}", def.version)
    } else {
        format!("enterprise-{}", def.version)
    };
    if def.build_no > 0 {
        tag.push_str(&format!("-{}", def.build_no));
    }
    if def.use_serverless {
        tag.push_str("-serverless");
    }
    if def.use_columnar {
        tag.push_str("-columnar");
    }
    tag
}

fn version_matches(candidate: &str, wanted: &str) -> bool {
    let candidate = candidate.trim_start_matches('v');
    let wanted = wanted.trim_start_matches('v');
    candidate == wanted || candidate.starts_with(&format!("{}.", wanted))
}

pub struct LocalImageProvider {
    runtime: Arc<dyn ContainerRuntime>,
    repository: String,
}

impl LocalImageProvider {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, repository: impl Into<String>) -> Self {
        Self {
            runtime,
            repository: repository.into(),
        }
    }

    /// Parsed local images of the repository, ordered by [`compare_image_defs`]
    async fn local_images(&self) -> Result<Vec<(ImageDef, String)>> {
        let prefix = format!("{}:", self.repository);
        let mut images: Vec<(ImageDef, String)> = self
            .runtime
            .list_image_tags(&self.repository)
            .await?
            .into_iter()
            .filter_map(|name| {
                let def = parse_tag(name.strip_prefix(&prefix)?)?;
                Some((def, name))
            })
            .collect();

        images.sort_by(|(a, _), (b, _)| compare_image_defs(a, b));
        Ok(images)
    }

    fn to_image(def: &ImageDef, name: String) -> Image {
        Image {
            source: "local".to_string(),
            name,
            version: def.server_version(),
        }
    }
}

#[async_trait]
impl ImageProvider for LocalImageProvider {
    async fn get_image(&self, def: &ImageDef) -> Result<ImageRef> {
        let images = self.local_images().await?;

        match images
            .into_iter()
            .find(|(candidate, _)| compare_image_defs(candidate, def).is_eq())
        {
            Some((_, name)) => {
                debug!(image = %name, wanted = %def, "resolved image");
                Ok(ImageRef::new(name))
            }
            None => Err(DeployError::ResourceNotFound(format!(
                "no local image for {} (expected {}:{})",
                def,
                self.repository,
                tag_for(def)
            ))),
        }
    }

    async fn list_images(&self) -> Result<Vec<Image>> {
        Ok(self
            .local_images()
            .await?
            .into_iter()
            .map(|(def, name)| Self::to_image(&def, name))
            .collect())
    }

    async fn search_images(&self, version: &str) -> Result<Vec<Image>> {
        Ok(self
            .local_images()
            .await?
            .into_iter()
            .filter(|(def, _)| version_matches(&def.version, version))
            .map(|(def, name)| Self::to_image(&def, name))
            .collect())
    }

    async fn get_image_raw(&self, image_path: &str) -> Result<ImageRef> {
        let (repository, _) = image_path
            .rsplit_once(':')
            .ok_or_else(|| DeployError::Configuration(format!("image {} has no tag", image_path)))?;

        let tags = self.runtime.list_image_tags(repository).await?;
        if tags.iter().any(|t| t == image_path) {
            Ok(ImageRef::new(image_path))
        } else {
            Err(DeployError::ResourceNotFound(format!(
                "image {} is not available locally",
                image_path
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::fake::FakeRuntime;

    #[test]
    fn test_parse_tag() {
        assert_eq!(parse_tag("enterprise-7.2.0"), Some(ImageDef::new("7.2.0")));
        assert_eq!(
            parse_tag("community-7.6.0-2176-serverless"),
            Some(ImageDef::new("7.6.0").with_build(2176).community().serverless())
        );
        assert_eq!(
            parse_tag("enterprise-8.0.0-columnar"),
            Some(ImageDef::new("8.0.0").columnar())
        );
        assert_eq!(parse_tag("latest"), None);
        assert_eq!(parse_tag("enterprise-"), None);
        assert_eq!(parse_tag("enterprise-7.2.0-12-34"), None);
    }

    #[test]
    fn test_image_def_for_full_reference() {
        assert_eq!(
            image_def_for("couchbase/server:community-7.2.0"),
            Some(ImageDef::new("7.2.0").community())
        );
        assert_eq!(
            image_def_for("registry.local:5000/couchbase/server:enterprise-7.6.1-3000"),
            Some(ImageDef::new("7.6.1").with_build(3000))
        );
        assert_eq!(image_def_for("couchbase/server"), None);
    }

    #[test]
    fn test_tag_for_inverts_parse() {
        for tag in [
            "enterprise-7.2.0",
            "community-7.1.4-5678",
            "enterprise-7.6.0-2176-serverless",
            "enterprise-8.0.0-1-columnar",
        ] {
            let def = parse_tag(tag).unwrap();
            assert_eq!(tag_for(&def), tag);
        }
    }

    fn provider() -> LocalImageProvider {
        let runtime = FakeRuntime::new().with_image_tags(&[
            "couchbase/server:enterprise-7.6.1",
            "couchbase/server:enterprise-7.2.0",
            "couchbase/server:community-7.2.0",
            "couchbase/server:enterprise-7.2.0-5000",
            "couchbase/server:latest",
            "other/server:enterprise-9.9.9",
        ]);
        LocalImageProvider::new(Arc::new(runtime), "couchbase/server")
    }

    #[tokio::test]
    async fn test_list_images_sorted() {
        let names: Vec<String> = provider()
            .list_images()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();

        assert_eq!(
            names,
            vec![
                "couchbase/server:community-7.2.0",
                "couchbase/server:enterprise-7.2.0",
                "couchbase/server:enterprise-7.2.0-5000",
                "couchbase/server:enterprise-7.6.1",
            ]
        );
    }

    #[tokio::test]
    async fn test_get_and_search_images() {
        let provider = provider();

        let image = provider
            .get_image(&ImageDef::new("7.2.0").community())
            .await
            .unwrap();
        assert_eq!(image.image_path, "couchbase/server:community-7.2.0");

        let err = provider
            .get_image(&ImageDef::new("7.0.0"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let found = provider.search_images("7.2").await.unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(found[2].version, "7.2.0-5000");

        assert!(provider
            .get_image_raw("couchbase/server:latest")
            .await
            .is_ok());
        assert!(provider
            .get_image_raw("couchbase/server:missing")
            .await
            .unwrap_err()
            .is_not_found());
    }
}
