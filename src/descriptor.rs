//! Deployment descriptor exchanged between build and deploy stages.
//!
//! The wire format is a JSON list of `{"name": ..., "imageUri": ...}` records,
//! conventionally written to `imagedefinitions.json`.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::DescriptorError;

pub const DEFAULT_DESCRIPTOR_FILE: &str = "imagedefinitions.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDefinition {
    pub name: String,
    #[serde(rename = "imageUri")]
    pub image_uri: String,
}

impl ImageDefinition {
    pub fn new(name: impl Into<String>, image_uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image_uri: image_uri.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentDescriptor {
    pub images: Vec<ImageDefinition>,
}

impl DeploymentDescriptor {
    /// Parses and checks that the descriptor is well-formed.
    pub fn parse(content: &str) -> Result<Self, DescriptorError> {
        let descriptor: DeploymentDescriptor = serde_json::from_str(content)?;
        descriptor.check()?;
        Ok(descriptor)
    }

    pub fn read(path: &Path) -> Result<Self, DescriptorError> {
        let content = std::fs::read_to_string(path).map_err(|source| DescriptorError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    fn check(&self) -> Result<(), DescriptorError> {
        if self.images.is_empty() {
            return Err(DescriptorError::Empty);
        }
        let mut seen = HashSet::new();
        for (idx, image) in self.images.iter().enumerate() {
            if image.name.trim().is_empty() {
                return Err(DescriptorError::EmptyName { position: idx + 1 });
            }
            if image.image_uri.trim().is_empty() {
                return Err(DescriptorError::EmptyImageUri {
                    name: image.name.clone(),
                });
            }
            if !seen.insert(image.name.as_str()) {
                return Err(DescriptorError::DuplicateName {
                    name: image.name.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "[]".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_build_output_format() {
        let descriptor =
            DeploymentDescriptor::parse(r#"[{"name":"flask-app","imageUri":"repo:tag123"}]"#)
                .unwrap();
        assert_eq!(
            descriptor.images,
            vec![ImageDefinition::new("flask-app", "repo:tag123")]
        );
    }

    #[test]
    fn rejects_empty_list() {
        let err = DeploymentDescriptor::parse("[]").unwrap_err();
        assert!(matches!(err, DescriptorError::Empty));
    }

    #[test]
    fn rejects_missing_image_uri() {
        let err = DeploymentDescriptor::parse(r#"[{"name":"flask-app"}]"#).unwrap_err();
        assert!(matches!(err, DescriptorError::InvalidJson(_)));
        assert!(err.to_string().starts_with("invalid JSON"));
    }

    #[test]
    fn rejects_blank_fields_and_duplicates() {
        assert!(matches!(
            DeploymentDescriptor::parse(r#"[{"name":" ","imageUri":"r:t"}]"#),
            Err(DescriptorError::EmptyName { position: 1 })
        ));
        assert!(matches!(
            DeploymentDescriptor::parse(r#"[{"name":"a","imageUri":""}]"#),
            Err(DescriptorError::EmptyImageUri { .. })
        ));
        let err = DeploymentDescriptor::parse(
            r#"[{"name":"a","imageUri":"r:1"},{"name":"a","imageUri":"r:2"}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, DescriptorError::DuplicateName { ref name } if name == "a"));
    }

    #[test]
    fn unreadable_file_names_the_path() {
        let err = DeploymentDescriptor::read(Path::new("/no/such/imagedefinitions.json"))
            .unwrap_err();
        assert!(matches!(err, DescriptorError::Read { .. }));
        assert!(err.to_string().contains("/no/such/imagedefinitions.json"));
    }

    #[test]
    fn serialises_with_camel_case_uri() {
        let descriptor = DeploymentDescriptor {
            images: vec![ImageDefinition::new("web", "registry/web:1")],
        };
        assert_eq!(
            descriptor.to_json(),
            r#"[{"name":"web","imageUri":"registry/web:1"}]"#
        );
    }
}
