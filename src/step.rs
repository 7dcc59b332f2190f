use serde::Deserialize;
use std::fmt;
use thiserror::Error;

// ========================= Wire Types =========================

/// Step kind as written by the recorder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    #[serde(alias = "click")]
    Click,
    #[serde(alias = "input")]
    Input,
    #[serde(alias = "keydown", alias = "keyDown")]
    Keydown,
    #[serde(alias = "scroll")]
    Scroll,
    #[serde(alias = "assert_url", alias = "assertUrl")]
    AssertUrl,
    #[serde(alias = "assert_text", alias = "assertText")]
    AssertText,
    #[serde(alias = "assert_visible", alias = "assertVisible")]
    AssertVisible,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Click => "CLICK",
            StepKind::Input => "INPUT",
            StepKind::Keydown => "KEYDOWN",
            StepKind::Scroll => "SCROLL",
            StepKind::AssertUrl => "ASSERT_URL",
            StepKind::AssertText => "ASSERT_TEXT",
            StepKind::AssertVisible => "ASSERT_VISIBLE",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Untyped step object exactly as the recorder emits it.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawStep {
    #[serde(rename = "type")]
    pub kind: Option<StepKind>,
    #[serde(default)]
    pub xpath: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManifestError {
    #[error("step is missing its type")]
    MissingType,
    #[error("{0} step requires an xpath or id locator")]
    MissingLocator(StepKind),
    #[error("{0} step requires a value")]
    MissingValue(StepKind),
}

// ========================= Typed Steps =========================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Locator {
    XPath { expr: String },
    Id { id: String },
}

impl Locator {
    /// xpath wins when both are recorded.
    pub fn from_parts(xpath: Option<&str>, id: Option<&str>) -> Option<Self> {
        let non_empty = |s: Option<&str>| s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
        if let Some(expr) = non_empty(xpath) {
            return Some(Locator::XPath { expr });
        }
        non_empty(id).map(|id| Locator::Id { id })
    }

    /// CSS selector for id locators; `None` for xpath.
    pub fn css_selector(&self) -> Option<String> {
        match self {
            Locator::XPath { .. } => None,
            Locator::Id { id } => Some(id_selector(id)),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::XPath { expr } => write!(f, "xpath={expr}"),
            Locator::Id { id } => write!(f, "#{id}"),
        }
    }
}

fn id_selector(id: &str) -> String {
    let mut chars = id.chars();
    let plain = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        }
        _ => false,
    };
    if plain {
        format!("#{id}")
    } else {
        format!("[id=\"{}\"]", id.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Click { target: Locator },
    Input { target: Locator, value: String },
    Keydown { key: String },
    Scroll,
    AssertUrl { expected: String },
    AssertText { expected: String },
    AssertVisible { target: Locator },
}

impl Action {
    pub fn kind(&self) -> StepKind {
        match self {
            Action::Click { .. } => StepKind::Click,
            Action::Input { .. } => StepKind::Input,
            Action::Keydown { .. } => StepKind::Keydown,
            Action::Scroll => StepKind::Scroll,
            Action::AssertUrl { .. } => StepKind::AssertUrl,
            Action::AssertText { .. } => StepKind::AssertText,
            Action::AssertVisible { .. } => StepKind::AssertVisible,
        }
    }

    pub fn is_assertion(&self) -> bool {
        matches!(
            self,
            Action::AssertUrl { .. } | Action::AssertText { .. } | Action::AssertVisible { .. }
        )
    }
}

/// One manifest entry. `url` is only meaningful on the first step.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawStep")]
pub struct Step {
    pub action: Action,
    pub url: Option<String>,
}

impl Step {
    pub fn new(action: Action) -> Self {
        Self { action, url: None }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn kind(&self) -> StepKind {
        self.action.kind()
    }
}

impl TryFrom<RawStep> for Step {
    type Error = ManifestError;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        let kind = raw.kind.ok_or(ManifestError::MissingType)?;
        let locator = Locator::from_parts(raw.xpath.as_deref(), raw.id.as_deref());
        let require_locator = || locator.clone().ok_or(ManifestError::MissingLocator(kind));
        // An empty expectation is kept: containment of "" always holds.
        let require_value = || raw.value.clone().ok_or(ManifestError::MissingValue(kind));

        let action = match kind {
            StepKind::Click => Action::Click { target: require_locator()? },
            StepKind::Input => Action::Input {
                target: require_locator()?,
                value: raw.value.clone().unwrap_or_default(),
            },
            StepKind::Keydown => Action::Keydown {
                key: raw
                    .key
                    .clone()
                    .or_else(|| raw.value.clone())
                    .filter(|k| !k.is_empty())
                    .unwrap_or_else(|| "Enter".to_string()),
            },
            StepKind::Scroll => Action::Scroll,
            StepKind::AssertUrl => Action::AssertUrl { expected: require_value()? },
            StepKind::AssertText => Action::AssertText { expected: require_value()? },
            StepKind::AssertVisible => Action::AssertVisible { target: require_locator()? },
        };

        let url = raw.url.filter(|u| !u.trim().is_empty());
        Ok(Step { action, url })
    }
}
