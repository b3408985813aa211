//! The closed set of actions agents may propose, and the fixed step
//! templates approved actions expand into.
//!
//! Keeping this a tagged enum (rather than a string-keyed table) means an
//! unknown action is rejected at the parse boundary instead of silently
//! expanding to a default template.

use serde::Deserialize;
use serde_json::Value;

/// Everything a proposal may ask for. Composite actions fan out into several
/// steps; primitive actions map to a single step of the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Crawl,
    Analyze,
    WriteContent,
    DraftTweet,
    PostTweet,
    Deploy,
    AnalyzeViralContent,
    DiagnoseFailure,
    ReviewContent,
    GatherIntel,
    StrategicAnalysis,
    QualityCheck,
    MakeDecision,
    PromoteInsight,
}

/// Execution type of a single step. Workers register one executor per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    Crawl,
    Analyze,
    WriteContent,
    DraftTweet,
    PostTweet,
    Deploy,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Crawl => "crawl",
            Action::Analyze => "analyze",
            Action::WriteContent => "write_content",
            Action::DraftTweet => "draft_tweet",
            Action::PostTweet => "post_tweet",
            Action::Deploy => "deploy",
            Action::AnalyzeViralContent => "analyze_viral_content",
            Action::DiagnoseFailure => "diagnose_failure",
            Action::ReviewContent => "review_content",
            Action::GatherIntel => "gather_intel",
            Action::StrategicAnalysis => "strategic_analysis",
            Action::QualityCheck => "quality_check",
            Action::MakeDecision => "make_decision",
            Action::PromoteInsight => "promote_insight",
        }
    }

    pub fn parse(raw: &str) -> Option<Action> {
        match raw.trim() {
            "crawl" => Some(Action::Crawl),
            "analyze" => Some(Action::Analyze),
            "write_content" => Some(Action::WriteContent),
            "draft_tweet" => Some(Action::DraftTweet),
            "post_tweet" => Some(Action::PostTweet),
            "deploy" => Some(Action::Deploy),
            "analyze_viral_content" => Some(Action::AnalyzeViralContent),
            "diagnose_failure" => Some(Action::DiagnoseFailure),
            "review_content" => Some(Action::ReviewContent),
            "gather_intel" => Some(Action::GatherIntel),
            "strategic_analysis" => Some(Action::StrategicAnalysis),
            "quality_check" => Some(Action::QualityCheck),
            "make_decision" => Some(Action::MakeDecision),
            "promote_insight" => Some(Action::PromoteInsight),
            _ => None,
        }
    }

    /// The ordered step template this action expands into. Template markers
    /// (crawl target, analysis type, output format) are merged into each
    /// step's params on top of the proposal params.
    pub fn step_template(&self) -> Vec<StepTemplate> {
        match self {
            Action::AnalyzeViralContent => vec![
                StepTemplate::new(StepKind::Crawl).with_marker("target", "engagement_data"),
                StepTemplate::new(StepKind::Analyze).with_marker("analysis_type", "viral_patterns"),
                StepTemplate::new(StepKind::WriteContent).with_marker("output_format", "report"),
            ],
            Action::DiagnoseFailure => vec![
                StepTemplate::new(StepKind::Analyze).with_marker("analysis_type", "root_cause"),
                StepTemplate::new(StepKind::WriteContent).with_marker("output_format", "diagnosis"),
            ],
            Action::ReviewContent => vec![
                StepTemplate::new(StepKind::Analyze).with_marker("analysis_type", "quality_review"),
                StepTemplate::new(StepKind::WriteContent).with_marker("output_format", "review"),
            ],
            Action::DraftTweet => vec![StepTemplate::new(StepKind::DraftTweet)],
            Action::PostTweet => vec![
                StepTemplate::new(StepKind::WriteContent).with_marker("output_format", "tweet"),
                StepTemplate::new(StepKind::PostTweet),
            ],
            Action::GatherIntel => vec![
                StepTemplate::new(StepKind::Crawl).with_marker("target", "news_sources"),
                StepTemplate::new(StepKind::Crawl).with_marker("target", "social_mentions"),
                StepTemplate::new(StepKind::Analyze).with_marker("analysis_type", "synthesize"),
            ],
            Action::StrategicAnalysis => vec![
                StepTemplate::new(StepKind::Analyze).with_marker("analysis_type", "strategy"),
                StepTemplate::new(StepKind::WriteContent)
                    .with_marker("output_format", "strategy_doc"),
            ],
            Action::QualityCheck => {
                vec![StepTemplate::new(StepKind::Analyze).with_marker("analysis_type", "quality")]
            }
            Action::MakeDecision => {
                vec![StepTemplate::new(StepKind::Analyze).with_marker("analysis_type", "decision")]
            }
            Action::PromoteInsight => vec![
                StepTemplate::new(StepKind::Analyze).with_marker("analysis_type", "promote_insight"),
            ],
            Action::Crawl => vec![StepTemplate::new(StepKind::Crawl)],
            Action::Analyze => vec![StepTemplate::new(StepKind::Analyze)],
            Action::WriteContent => vec![StepTemplate::new(StepKind::WriteContent)],
            Action::Deploy => vec![StepTemplate::new(StepKind::Deploy)],
        }
    }
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Crawl => "crawl",
            StepKind::Analyze => "analyze",
            StepKind::WriteContent => "write_content",
            StepKind::DraftTweet => "draft_tweet",
            StepKind::PostTweet => "post_tweet",
            StepKind::Deploy => "deploy",
        }
    }

    pub fn parse(raw: &str) -> Option<StepKind> {
        match raw.trim() {
            "crawl" => Some(StepKind::Crawl),
            "analyze" => Some(StepKind::Analyze),
            "write_content" => Some(StepKind::WriteContent),
            "draft_tweet" => Some(StepKind::DraftTweet),
            "post_tweet" => Some(StepKind::PostTweet),
            "deploy" => Some(StepKind::Deploy),
            _ => None,
        }
    }
}

impl serde::Serialize for Action {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for Action {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Action::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown action '{}'", raw)))
    }
}

impl serde::Serialize for StepKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for StepKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        StepKind::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown step kind '{}'", raw)))
    }
}

/// One entry of an action's step template.
#[derive(Debug, Clone)]
pub struct StepTemplate {
    pub kind: StepKind,
    marker: Option<(&'static str, &'static str)>,
}

impl StepTemplate {
    fn new(kind: StepKind) -> Self {
        Self { kind, marker: None }
    }

    fn with_marker(mut self, key: &'static str, value: &'static str) -> Self {
        self.marker = Some((key, value));
        self
    }

    /// Merge the template marker into the proposal params. The marker wins on
    /// key collision so a proposal cannot redirect a template step.
    pub fn step_params(&self, proposal_params: &Value) -> Value {
        let mut params = match proposal_params {
            Value::Object(map) => Value::Object(map.clone()),
            Value::Null => Value::Object(serde_json::Map::new()),
            other => serde_json::json!({ "input": other }),
        };
        if let (Some((key, value)), Some(map)) = (self.marker, params.as_object_mut()) {
            map.insert(key.to_string(), Value::String(value.to_string()));
        }
        params
    }
}
