//! The media package: the artifact a workflow transforms.
//!
//! The engine never interprets element contents. Operations read elements
//! by id or flavor and append new ones.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Kind of a media package element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Track,
    Catalog,
    Attachment,
}

impl std::str::FromStr for ElementKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "track" => Ok(ElementKind::Track),
            "catalog" => Ok(ElementKind::Catalog),
            "attachment" => Ok(ElementKind::Attachment),
            other => Err(CoreError::Validation(format!(
                "Unknown element kind '{other}'"
            ))),
        }
    }
}

/// One element of a media package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaPackageElement {
    pub id: String,
    /// `type/subtype`, e.g. `presenter/source`.
    pub flavor: String,
    pub kind: ElementKind,
    /// Location of the element's content, if it has one.
    pub uri: Option<String>,
}

impl MediaPackageElement {
    /// New element with a generated id.
    pub fn new(kind: ElementKind, flavor: impl Into<String>, uri: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            flavor: flavor.into(),
            kind,
            uri,
        }
    }
}

/// The artifact carried through a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaPackage {
    pub id: Uuid,
    pub title: Option<String>,
    pub elements: Vec<MediaPackageElement>,
}

impl Default for MediaPackage {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaPackage {
    pub fn new() -> Self {
        Self {
            id: Uuid::now_v7(),
            title: None,
            elements: Vec::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Append an element. Element ids must be unique within the package.
    pub fn add(&mut self, element: MediaPackageElement) -> Result<(), CoreError> {
        if self.element(&element.id).is_some() {
            return Err(CoreError::IllegalState(format!(
                "Media package {} already contains element {}",
                self.id, element.id
            )));
        }
        self.elements.push(element);
        Ok(())
    }

    pub fn element(&self, id: &str) -> Option<&MediaPackageElement> {
        self.elements.iter().find(|e| e.id == id)
    }

    /// Elements whose flavor matches `pattern`; see [`flavor_matches`].
    pub fn elements_by_flavor<'a>(
        &'a self,
        pattern: &'a str,
    ) -> impl Iterator<Item = &'a MediaPackageElement> + 'a {
        self.elements
            .iter()
            .filter(move |e| flavor_matches(pattern, &e.flavor))
    }

    pub fn elements_of_kind(
        &self,
        kind: ElementKind,
    ) -> impl Iterator<Item = &MediaPackageElement> + '_ {
        self.elements.iter().filter(move |e| e.kind == kind)
    }
}

/// Match a `type/subtype` flavor against a pattern where either half may
/// be `*`.
pub fn flavor_matches(pattern: &str, flavor: &str) -> bool {
    let (p_type, p_sub) = split_flavor(pattern);
    let (f_type, f_sub) = split_flavor(flavor);
    part_matches(p_type, f_type) && part_matches(p_sub, f_sub)
}

fn split_flavor(flavor: &str) -> (&str, &str) {
    flavor.split_once('/').unwrap_or((flavor, "*"))
}

fn part_matches(pattern: &str, value: &str) -> bool {
    pattern == "*" || pattern.eq_ignore_ascii_case(value)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
