//! Intent vocabulary, registry, and classification result.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// String-keyed entity map extracted alongside an intent.
pub type Entities = BTreeMap<String, serde_json::Value>;

/// Closed vocabulary of intents the assistant understands.
///
/// `Unrecognized` is the sentinel for anything outside the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    FacilityQuery,
    EventQuery,
    CourseInfo,
    PhysicalTest,
    Feedback,
    HealthAdvice,
    ExtraExercise,
    Unrecognized,
}

impl Intent {
    /// Every registered intent, in local-rule priority order.
    pub const REGISTERED: [Intent; 7] = [
        Intent::FacilityQuery,
        Intent::EventQuery,
        Intent::CourseInfo,
        Intent::PhysicalTest,
        Intent::Feedback,
        Intent::HealthAdvice,
        Intent::ExtraExercise,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::FacilityQuery => "facility_query",
            Intent::EventQuery => "event_query",
            Intent::CourseInfo => "course_info",
            Intent::PhysicalTest => "physical_test",
            Intent::Feedback => "feedback",
            Intent::HealthAdvice => "health_advice",
            Intent::ExtraExercise => "extra_exercise",
            Intent::Unrecognized => "unrecognized",
        }
    }

    /// Map any label onto the vocabulary, coercing unknown labels to `Unrecognized`.
    pub fn from_label(label: &str) -> Intent {
        label.parse().unwrap_or(Intent::Unrecognized)
    }

    /// Whether answers for this intent may carry images.
    pub fn is_media_capable(&self) -> bool {
        matches!(self, Intent::FacilityQuery | Intent::EventQuery)
    }

    pub fn is_unrecognized(&self) -> bool {
        matches!(self, Intent::Unrecognized)
    }

    /// Source name reported when the knowledge base supplies no explicit tag.
    pub fn default_source(&self) -> &'static str {
        match self {
            Intent::FacilityQuery => "PKU Sports Facilities Database",
            Intent::EventQuery => "PKU Sports Events Calendar",
            Intent::CourseInfo => "PKU Physical Education Course Catalog",
            Intent::PhysicalTest => "National Student Physical Health Standard",
            Intent::Feedback => "PKU Sports Service Feedback Desk",
            Intent::HealthAdvice => "PKU Sports Health Guidance",
            Intent::ExtraExercise => "PKU Extracurricular Exercise Handbook",
            Intent::Unrecognized => "Internal System Response",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a label is not part of the vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownIntent(pub String);

impl fmt::Display for UnknownIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown intent: {}", self.0)
    }
}

impl std::error::Error for UnknownIntent {}

impl FromStr for Intent {
    type Err = UnknownIntent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "facility_query" => Ok(Intent::FacilityQuery),
            "event_query" => Ok(Intent::EventQuery),
            "course_info" => Ok(Intent::CourseInfo),
            "physical_test" => Ok(Intent::PhysicalTest),
            "feedback" => Ok(Intent::Feedback),
            "health_advice" => Ok(Intent::HealthAdvice),
            "extra_exercise" => Ok(Intent::ExtraExercise),
            "unrecognized" | "unrecognized_intent" => Ok(Intent::Unrecognized),
            other => Err(UnknownIntent(other.to_string())),
        }
    }
}

/// Outcome of intent classification for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentResult {
    pub session_id: String,
    pub intent: Intent,
    #[serde(default)]
    pub entities: Entities,
    pub confidence: f64,
    #[serde(default)]
    pub clarification_needed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification_prompt: Option<String>,
}

impl IntentResult {
    /// Create a result, clamping confidence into `[0, 1]`.
    pub fn new(session_id: impl Into<String>, intent: Intent, confidence: f64) -> Self {
        Self {
            session_id: session_id.into(),
            intent,
            entities: Entities::new(),
            confidence: clamp_confidence(confidence),
            clarification_needed: false,
            clarification_prompt: None,
        }
    }

    /// The sentinel result: unrecognized with zero confidence.
    pub fn unrecognized(session_id: impl Into<String>) -> Self {
        Self::new(session_id, Intent::Unrecognized, 0.0)
    }

    /// An unrecognized result asking the user to rephrase.
    pub fn clarification(session_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            clarification_needed: true,
            clarification_prompt: Some(prompt.into()),
            ..Self::unrecognized(session_id)
        }
    }

    pub fn with_entities(mut self, entities: Entities) -> Self {
        self.entities = entities;
        self
    }

    pub fn with_entity(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.entities.insert(key.into(), value);
        self
    }
}

pub(crate) fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

/// Keyword-driven entity extraction attached to a registry entry.
///
/// The first category with any keyword present in the text becomes the
/// entity value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRule {
    pub name: String,
    pub categories: Vec<(String, Vec<String>)>,
}

impl EntityRule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            categories: Vec::new(),
        }
    }

    pub fn category(mut self, value: impl Into<String>, keywords: &[&str]) -> Self {
        self.categories.push((
            value.into(),
            keywords.iter().map(|k| k.to_string()).collect(),
        ));
        self
    }

    /// Resolve the category for a text, if any keyword matches.
    pub fn resolve(&self, text: &str) -> Option<&str> {
        self.categories
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| text.contains(k.as_str())))
            .map(|(value, _)| value.as_str())
    }
}

/// One registry entry: an intent and the material used to recognise it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentDefinition {
    pub intent: Intent,
    pub name: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub examples: Vec<String>,
    #[serde(default)]
    pub entity_rules: Vec<EntityRule>,
}

impl IntentDefinition {
    pub fn new(intent: Intent, name: &str, description: &str) -> Self {
        Self {
            intent,
            name: name.to_string(),
            description: description.to_string(),
            keywords: Vec::new(),
            examples: Vec::new(),
            entity_rules: Vec::new(),
        }
    }

    pub fn keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords = keywords.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn examples(mut self, examples: &[&str]) -> Self {
        self.examples = examples.iter().map(|e| e.to_string()).collect();
        self
    }

    pub fn entity_rule(mut self, rule: EntityRule) -> Self {
        self.entity_rules.push(rule);
        self
    }

    /// First keyword contained in the text, if any.
    pub fn matching_keyword(&self, text: &str) -> Option<&str> {
        self.keywords
            .iter()
            .find(|k| !k.is_empty() && text.contains(k.as_str()))
            .map(|k| k.as_str())
    }

    /// Apply entity rules to the text.
    pub fn extract_entities(&self, text: &str) -> Entities {
        let mut entities = Entities::new();
        for rule in &self.entity_rules {
            if let Some(value) = rule.resolve(text) {
                entities.insert(rule.name.clone(), serde_json::Value::String(value.to_string()));
            }
        }
        entities
    }
}

/// Immutable lookup table of registered intents.
///
/// Built once at startup and shared by `Arc`; the order of entries is the
/// local-rule priority order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentRegistry {
    entries: Vec<IntentDefinition>,
}

impl IntentRegistry {
    /// Build a registry from explicit entries. `Unrecognized` entries are dropped.
    pub fn new(entries: Vec<IntentDefinition>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .filter(|e| !e.intent.is_unrecognized())
                .collect(),
        }
    }

    pub fn entries(&self) -> &[IntentDefinition] {
        &self.entries
    }

    pub fn get(&self, intent: Intent) -> Option<&IntentDefinition> {
        self.entries.iter().find(|e| e.intent == intent)
    }

    pub fn contains(&self, intent: Intent) -> bool {
        self.get(intent).is_some()
    }

    /// First registered intent with any keyword contained in the text.
    pub fn match_local(&self, text: &str) -> Option<(&IntentDefinition, &str)> {
        self.entries
            .iter()
            .find_map(|def| def.matching_keyword(text).map(|k| (def, k)))
    }

    /// Coerce a model-supplied label: anything outside the registry is `Unrecognized`.
    pub fn resolve_label(&self, label: &str) -> Intent {
        let intent = Intent::from_label(label);
        if self.contains(intent) {
            intent
        } else {
            Intent::Unrecognized
        }
    }
}

impl Default for IntentRegistry {
    fn default() -> Self {
        Self::new(vec![
            IntentDefinition::new(
                Intent::FacilityQuery,
                "设施查询",
                "用户询问关于体育设施（如体育馆、游泳池、跑道等）的信息，例如开放时间、位置、预订方式等。",
            )
            .keywords(&[
                "邱德拔", "康美乐", "五四", "二体", "理教地下", "游泳池", "羽毛球场", "乒乓球场",
                "预定", "开放时间", "在哪里", "篮球场", "预约",
            ])
            .examples(&["邱德拔什么时候开门", "篮球场怎么预订", "羽毛球馆现在有空位吗"]),
            IntentDefinition::new(
                Intent::EventQuery,
                "活动/赛事查询",
                "用户询问关于体育赛事、活动（如篮球赛、足球赛、健身活动等）的信息，例如时间、地点、参与方式、结果等。",
            )
            .keywords(&[
                "北大杯", "五四长跑", "赛事", "报名", "夜奔", "新生杯", "时间", "地点", "结果", "参与",
            ])
            .examples(&["这周四的夜奔是什么主题", "五四长跑怎么报名", "昨天的北大杯足球赛结果是什么"]),
            IntentDefinition::new(
                Intent::CourseInfo,
                "课程查询",
                "用户询问关于体育课程（如篮球课、游泳课、健身指导等）的信息，例如课程内容、时间、费用、报名方式等。",
            )
            .keywords(&["课程", "老师", "教学", "学习", "上课地点", "上课时间"])
            .examples(&["游泳课在哪上", "排球课的上课时间"]),
            IntentDefinition::new(
                Intent::PhysicalTest,
                "身体素质测试",
                "用户询问关于身体素质测试或相关标准的信息。",
            )
            .keywords(&[
                "体测", "身体素质", "标准", "测试", "1000米", "800m", "引体向上", "跳远", "仰卧起坐",
                "准备考试", "如何提高",
            ])
            .examples(&["体测有什么项目", "大二男生引体向上的标准是什么", "如何准备1000米考试"]),
            IntentDefinition::new(
                Intent::Feedback,
                "反馈",
                "用户提供关于助手的反馈、建议或报告问题。",
            )
            .keywords(&["反馈", "建议", "维修", "不好用", "投诉", "态度差", "bug", "改进"])
            .examples(&["这个助手不太好用", "我有一个建议", "这里好像有个bug"]),
            IntentDefinition::new(
                Intent::HealthAdvice,
                "运动建议",
                "用户寻求关于特定运动、健身计划或健康生活方式的建议。",
            )
            .keywords(&["建议", "怎么运动", "计划", "健身", "锻炼", "食谱", "减肥", "增肌"])
            .examples(&["我想减肥，有什么运动建议", "如何制定健身计划", "推荐一些增肌的训练"]),
            IntentDefinition::new(
                Intent::ExtraExercise,
                "课外锻炼",
                "用户寻求关于课外锻炼的要求、规则以及使用软件遇到困难时的解决办法。",
            )
            .keywords(&[
                "85km", "PKU Runner", "乐动力", "课外锻炼", "里程奖励", "闪退", "配速", "跑步位置",
            ])
            .examples(&["85km必须在五四跑吗", "使用PKU Runner时软件总是闪退，该怎么解决", "85km要求配速是多少"])
            .entity_rule(
                EntityRule::new("info_type")
                    .category("requirements", &["要求", "标准", "配速多少"])
                    .category("rules", &["注意", "禁止", "违规"])
                    .category("rewards", &["里程奖励"])
                    .category("app_usage", &["怎么用", "闪退", "异常", "PKU Runner", "乐动力"])
                    .category("feedback", &["反馈", "管理员", "联系"]),
            ),
        ])
    }
}
