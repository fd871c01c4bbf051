//! Playbook Data Model
//!
//! Core data structures describing a playbook: its ordered steps, declared
//! parameters, and free-form metadata.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: Module Upgrade
//! version: "1.2"
//! description: Upload and install a module, then restart the gateway
//! metadata:
//!   domain: gateway
//! parameters:
//!   - name: gateway_url
//!     type: string
//!     validator: url
//!   - name: gateway_credential
//!     type: credential
//! steps:
//!   - id: login
//!     name: Log in to gateway
//!     type: gateway.login
//!     parameters:
//!       url: "{{ gateway_url }}"
//!       username: "{{ gateway_credential.username }}"
//!       password: "{{ gateway_credential.password }}"
//!   - id: restart
//!     name: Restart gateway
//!     type: gateway.restart
//!     timeout: 600
//!     retry_count: 1
//!     on_failure: continue
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default step timeout in seconds.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

fn default_timeout() -> u64 {
    DEFAULT_STEP_TIMEOUT_SECS
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_required() -> bool {
    true
}

/// Target area a playbook or step operates on.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Gateway,
    Browser,
    Perspective,
    Designer,
    Utility,
}

impl Domain {
    /// Parses a domain name, returning `None` for unrecognized values.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gateway" => Some(Self::Gateway),
            "browser" => Some(Self::Browser),
            "perspective" => Some(Self::Perspective),
            "designer" => Some(Self::Designer),
            "utility" => Some(Self::Utility),
            _ => None,
        }
    }
}

/// Closed set of step kinds. Each kind is served by exactly one executor.
///
/// Step types serialize as their dotted tag, e.g. `gateway.login`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub enum StepType {
    GatewayLogin,
    GatewayLogout,
    GatewayPing,
    GatewayGetInfo,
    GatewayGetHealth,
    GatewayListModules,
    GatewayUploadModule,
    GatewayWaitModuleInstallation,
    GatewayListProjects,
    GatewayRestart,
    GatewayWaitForReady,
    BrowserNavigate,
    BrowserClick,
    BrowserFill,
    BrowserFileUpload,
    BrowserWait,
    BrowserVerify,
    BrowserScreenshot,
    PerspectiveOpenView,
    PerspectiveClickComponent,
    PerspectiveVerifyComponent,
    DesignerLaunch,
    DesignerLogin,
    DesignerOpenProject,
    DesignerClose,
    UtilitySleep,
    UtilityLog,
    UtilitySetVariable,
}

impl StepType {
    /// Every step type, in declaration order.
    pub const ALL: [StepType; 28] = [
        Self::GatewayLogin,
        Self::GatewayLogout,
        Self::GatewayPing,
        Self::GatewayGetInfo,
        Self::GatewayGetHealth,
        Self::GatewayListModules,
        Self::GatewayUploadModule,
        Self::GatewayWaitModuleInstallation,
        Self::GatewayListProjects,
        Self::GatewayRestart,
        Self::GatewayWaitForReady,
        Self::BrowserNavigate,
        Self::BrowserClick,
        Self::BrowserFill,
        Self::BrowserFileUpload,
        Self::BrowserWait,
        Self::BrowserVerify,
        Self::BrowserScreenshot,
        Self::PerspectiveOpenView,
        Self::PerspectiveClickComponent,
        Self::PerspectiveVerifyComponent,
        Self::DesignerLaunch,
        Self::DesignerLogin,
        Self::DesignerOpenProject,
        Self::DesignerClose,
        Self::UtilitySleep,
        Self::UtilityLog,
        Self::UtilitySetVariable,
    ];

    /// Returns the dotted tag used in playbook files.
    pub fn tag(self) -> &'static str {
        match self {
            Self::GatewayLogin => "gateway.login",
            Self::GatewayLogout => "gateway.logout",
            Self::GatewayPing => "gateway.ping",
            Self::GatewayGetInfo => "gateway.get_info",
            Self::GatewayGetHealth => "gateway.get_health",
            Self::GatewayListModules => "gateway.list_modules",
            Self::GatewayUploadModule => "gateway.upload_module",
            Self::GatewayWaitModuleInstallation => "gateway.wait_module_installation",
            Self::GatewayListProjects => "gateway.list_projects",
            Self::GatewayRestart => "gateway.restart",
            Self::GatewayWaitForReady => "gateway.wait_for_ready",
            Self::BrowserNavigate => "browser.navigate",
            Self::BrowserClick => "browser.click",
            Self::BrowserFill => "browser.fill",
            Self::BrowserFileUpload => "browser.file_upload",
            Self::BrowserWait => "browser.wait",
            Self::BrowserVerify => "browser.verify",
            Self::BrowserScreenshot => "browser.screenshot",
            Self::PerspectiveOpenView => "perspective.open_view",
            Self::PerspectiveClickComponent => "perspective.click_component",
            Self::PerspectiveVerifyComponent => "perspective.verify_component",
            Self::DesignerLaunch => "designer.launch",
            Self::DesignerLogin => "designer.login",
            Self::DesignerOpenProject => "designer.open_project",
            Self::DesignerClose => "designer.close",
            Self::UtilitySleep => "utility.sleep",
            Self::UtilityLog => "utility.log",
            Self::UtilitySetVariable => "utility.set_variable",
        }
    }

    /// Returns the domain this step type belongs to.
    pub fn domain(self) -> Domain {
        match self {
            Self::GatewayLogin
            | Self::GatewayLogout
            | Self::GatewayPing
            | Self::GatewayGetInfo
            | Self::GatewayGetHealth
            | Self::GatewayListModules
            | Self::GatewayUploadModule
            | Self::GatewayWaitModuleInstallation
            | Self::GatewayListProjects
            | Self::GatewayRestart
            | Self::GatewayWaitForReady => Domain::Gateway,
            Self::BrowserNavigate
            | Self::BrowserClick
            | Self::BrowserFill
            | Self::BrowserFileUpload
            | Self::BrowserWait
            | Self::BrowserVerify
            | Self::BrowserScreenshot => Domain::Browser,
            Self::PerspectiveOpenView
            | Self::PerspectiveClickComponent
            | Self::PerspectiveVerifyComponent => Domain::Perspective,
            Self::DesignerLaunch
            | Self::DesignerLogin
            | Self::DesignerOpenProject
            | Self::DesignerClose => Domain::Designer,
            Self::UtilitySleep | Self::UtilityLog | Self::UtilitySetVariable => Domain::Utility,
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.tag() == tag)
            .ok_or_else(|| format!("Unknown step type '{}'", tag))
    }
}

impl TryFrom<String> for StepType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StepType> for String {
    fn from(value: StepType) -> Self {
        value.tag().to_string()
    }
}

/// What to do when a step fails.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    /// Halt the playbook and mark the execution failed
    #[default]
    #[serde(alias = "ABORT")]
    Abort,
    /// Record the failure and proceed to the next step
    #[serde(alias = "CONTINUE")]
    Continue,
    /// Record the failure and skip past the step
    #[serde(alias = "SKIP")]
    Skip,
}

impl OnFailure {
    /// Returns true if a failure under this policy halts the playbook.
    pub fn halts(self) -> bool {
        matches!(self, Self::Abort)
    }
}

/// A single step in a playbook.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PlaybookStep {
    /// Unique identifier within the playbook
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Executor tag
    #[serde(rename = "type")]
    pub step_type: StepType,

    /// Executor parameters; string values may contain `{{ name }}` placeholders
    #[serde(default)]
    pub parameters: HashMap<String, Value>,

    /// Timeout per attempt, in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Additional attempts after the first failure
    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub on_failure: OnFailure,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl PlaybookStep {
    /// Creates a step with default timeout, no retries, and the ABORT policy.
    ///
    /// # Example
    ///
    /// ```
    /// use playrunner::playbook::{OnFailure, PlaybookStep, StepType};
    ///
    /// let step = PlaybookStep::new("wait", "Wait for restart", StepType::UtilitySleep)
    ///     .with_parameter("seconds", 5)
    ///     .with_retries(2)
    ///     .with_on_failure(OnFailure::Continue);
    /// ```
    pub fn new(id: impl Into<String>, name: impl Into<String>, step_type: StepType) -> Self {
        Self {
            id: id.into().trim().to_string(),
            name: name.into().trim().to_string(),
            step_type,
            parameters: HashMap::new(),
            timeout: DEFAULT_STEP_TIMEOUT_SECS,
            retry_count: 0,
            on_failure: OnFailure::Abort,
            description: String::new(),
        }
    }

    /// Sets a single executor parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Sets the per-attempt timeout in seconds.
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }

    /// Sets the retry count.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retry_count = retries;
        self
    }

    /// Sets the on-failure policy.
    pub fn with_on_failure(mut self, policy: OnFailure) -> Self {
        self.on_failure = policy;
        self
    }
}

/// Declared type of a playbook parameter.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Integer,
    Float,
    Boolean,
    /// Name of a credential held by the vault
    Credential,
    /// Path to a file
    File,
    List,
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Credential => "credential",
            Self::File => "file",
            Self::List => "list",
        };
        f.write_str(name)
    }
}

/// Extra constraint checked after the type check.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ParameterValidator {
    /// Value must not be empty or whitespace
    NonEmpty,
    /// Value must be an http(s) URL
    Url,
    /// Numeric value must fall within the bounds
    Range {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    /// Value must be one of the listed choices
    OneOf(Vec<String>),
}

/// A parameter declared by a playbook.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PlaybookParameter {
    pub name: String,

    #[serde(rename = "type", default = "default_parameter_type")]
    pub param_type: ParameterType,

    #[serde(default = "default_required")]
    pub required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator: Option<ParameterValidator>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

fn default_parameter_type() -> ParameterType {
    ParameterType::String
}

impl PlaybookParameter {
    /// Creates a required parameter of the given type.
    pub fn new(name: impl Into<String>, param_type: ParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: true,
            default: None,
            validator: None,
            description: String::new(),
        }
    }

    /// Marks the parameter optional.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Sets the default value.
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Sets the validator.
    pub fn with_validator(mut self, validator: ParameterValidator) -> Self {
        self.validator = Some(validator);
        self
    }
}

/// A named, versioned sequence of steps with declared parameters.
///
/// Playbooks are immutable once loaded; the engine only reads them.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Playbook {
    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub description: String,

    /// Steps in execution order
    #[serde(default)]
    pub steps: Vec<PlaybookStep>,

    #[serde(default)]
    pub parameters: Vec<PlaybookParameter>,

    /// Free-form metadata; `domain` selects the playbook's target area
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Playbook {
    /// Creates an empty playbook.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            description: String::new(),
            steps: Vec::new(),
            parameters: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Appends a step.
    pub fn with_step(mut self, step: PlaybookStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Appends a parameter declaration.
    pub fn with_parameter(mut self, parameter: PlaybookParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Sets a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Returns the playbook's domain from its metadata, if recognized.
    pub fn domain(&self) -> Option<Domain> {
        self.metadata
            .get("domain")
            .and_then(Value::as_str)
            .and_then(Domain::parse)
    }

    /// Returns the raw domain tag as written in metadata.
    pub fn domain_tag(&self) -> Option<String> {
        self.metadata
            .get("domain")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Returns true if the playbook requires a browser session.
    ///
    /// Perspective and gateway playbooks always get one; any other playbook
    /// gets one if it contains a browser or perspective step.
    pub fn needs_browser(&self) -> bool {
        matches!(self.domain(), Some(Domain::Perspective | Domain::Gateway))
            || self
                .steps
                .iter()
                .any(|s| matches!(s.step_type.domain(), Domain::Browser | Domain::Perspective))
    }

    /// Returns true if any step drives the designer.
    pub fn needs_designer(&self) -> bool {
        self.steps
            .iter()
            .any(|s| s.step_type.domain() == Domain::Designer)
    }

    /// Returns true if any step talks to the gateway REST interface.
    pub fn needs_gateway(&self) -> bool {
        self.steps
            .iter()
            .any(|s| s.step_type.domain() == Domain::Gateway)
    }

    /// Returns the distinct step types used by this playbook.
    pub fn step_types(&self) -> BTreeSet<StepType> {
        self.steps.iter().map(|s| s.step_type).collect()
    }

    /// Gets a step by ID.
    pub fn get_step(&self, id: &str) -> Option<&PlaybookStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Gets a parameter declaration by name.
    pub fn get_parameter(&self, name: &str) -> Option<&PlaybookParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Returns the number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the playbook has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_defaults() {
        let step = PlaybookStep::new(" login ", "Login", StepType::GatewayLogin);
        assert_eq!(step.id, "login");
        assert_eq!(step.timeout, 300);
        assert_eq!(step.retry_count, 0);
        assert_eq!(step.on_failure, OnFailure::Abort);
    }

    #[test]
    fn test_step_type_tags_are_unique_and_parse_back() {
        let mut seen = BTreeSet::new();
        for t in StepType::ALL {
            assert!(seen.insert(t.tag()), "duplicate tag {}", t.tag());
            assert_eq!(t.tag().parse::<StepType>().unwrap(), t);
        }
    }

    #[test]
    fn test_step_type_domain_matches_tag_prefix() {
        for t in StepType::ALL {
            let prefix = t.tag().split('.').next().unwrap();
            assert_eq!(Domain::parse(prefix), Some(t.domain()));
        }
    }

    #[test]
    fn test_unknown_step_type_rejected() {
        assert!("gateway.teleport".parse::<StepType>().is_err());
    }

    #[test]
    fn test_deserialize_playbook_yaml() {
        let yaml = r#"
name: Upgrade
metadata:
  domain: gateway
parameters:
  - name: gateway_url
    type: string
    validator: url
  - name: retries
    type: integer
    required: false
    default: 3
    validator:
      range: { min: 0, max: 10 }
steps:
  - id: login
    name: Login
    type: gateway.login
    parameters:
      url: "{{ gateway_url }}"
  - id: pause
    name: Pause
    type: utility.sleep
    on_failure: CONTINUE
    retry_count: 2
"#;
        let playbook: Playbook = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(playbook.version, "1.0");
        assert_eq!(playbook.len(), 2);
        assert_eq!(playbook.steps[0].step_type, StepType::GatewayLogin);
        assert_eq!(playbook.steps[1].on_failure, OnFailure::Continue);
        assert_eq!(playbook.steps[1].retry_count, 2);
        assert!(playbook.parameters[0].required);
        assert_eq!(playbook.parameters[0].validator, Some(ParameterValidator::Url));
        assert_eq!(
            playbook.parameters[1].validator,
            Some(ParameterValidator::Range { min: Some(0.0), max: Some(10.0) })
        );
        assert_eq!(playbook.domain(), Some(Domain::Gateway));
    }

    #[test]
    fn test_needs_browser_from_domain() {
        let playbook = Playbook::new("p").with_metadata("domain", "perspective");
        assert!(playbook.needs_browser());

        let playbook = Playbook::new("g").with_metadata("domain", "gateway");
        assert!(playbook.needs_browser());

        let playbook = Playbook::new("u").with_metadata("domain", "utility");
        assert!(!playbook.needs_browser());
    }

    #[test]
    fn test_needs_browser_from_steps() {
        let playbook = Playbook::new("u")
            .with_metadata("domain", "utility")
            .with_step(PlaybookStep::new("c", "Click", StepType::BrowserClick));
        assert!(playbook.needs_browser());
        assert!(!playbook.needs_designer());
    }

    #[test]
    fn test_needs_designer() {
        let playbook = Playbook::new("d")
            .with_step(PlaybookStep::new("l", "Launch", StepType::DesignerLaunch));
        assert!(playbook.needs_designer());
        assert!(!playbook.needs_browser());
    }

    #[test]
    fn test_unrecognized_domain_is_none() {
        let playbook = Playbook::new("x").with_metadata("domain", "mystery");
        assert_eq!(playbook.domain(), None);
        assert_eq!(playbook.domain_tag().as_deref(), Some("mystery"));
    }

    #[test]
    fn test_step_types_collects_distinct() {
        let playbook = Playbook::new("p")
            .with_step(PlaybookStep::new("a", "A", StepType::UtilityLog))
            .with_step(PlaybookStep::new("b", "B", StepType::UtilityLog))
            .with_step(PlaybookStep::new("c", "C", StepType::UtilitySleep));
        assert_eq!(playbook.step_types().len(), 2);
    }
}
