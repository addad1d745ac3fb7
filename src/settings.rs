use crate::calc::{CurriculumKind, RankPolicy};
use crate::db;
use crate::matrix::{GradingOptions, OutOfRangePolicy};
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Grading,
    Positions,
}

impl Section {
    pub const ALL: [Section; 2] = [Section::Grading, Section::Positions];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "grading" => Some(Self::Grading),
            "positions" => Some(Self::Positions),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Grading => "grading",
            Self::Positions => "positions",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Grading => "setup.grading",
            Self::Positions => "setup.positions",
        }
    }
}

fn default_section(section: Section) -> Value {
    match section {
        Section::Grading => json!({
            "defaultCurriculum": "standard",
            "outOfRangePolicy": "reject",
            "rankPolicy": "position",
            "igcseCourseworkWeight": 30,
            "defaultAcademicYear": ""
        }),
        Section::Positions => json!({
            "autoRecalculate": true,
            "debounceMs": 2000
        }),
    }
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

pub fn merge_section_patch(
    section: Section,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            Section::Grading => match k.as_str() {
                "defaultCurriculum" => {
                    let s = parse_string_max(v, k, 16)?;
                    let kind = CurriculumKind::parse(&s).ok_or_else(|| {
                        "defaultCurriculum must be one of: standard, cbc, igcse".to_string()
                    })?;
                    obj.insert(k.clone(), Value::String(kind.as_str().to_string()));
                }
                "outOfRangePolicy" => {
                    let s = parse_string_max(v, k, 16)?;
                    let policy = OutOfRangePolicy::parse(&s).ok_or_else(|| {
                        "outOfRangePolicy must be one of: reject, clear".to_string()
                    })?;
                    obj.insert(k.clone(), Value::String(policy.as_str().to_string()));
                }
                "rankPolicy" => {
                    let s = parse_string_max(v, k, 16)?;
                    let policy = RankPolicy::parse(&s).ok_or_else(|| {
                        "rankPolicy must be one of: position, competition".to_string()
                    })?;
                    obj.insert(k.clone(), Value::String(policy.as_str().to_string()));
                }
                "igcseCourseworkWeight" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 100)?));
                }
                "defaultAcademicYear" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 16)?));
                }
                _ => return Err(format!("unknown grading field: {}", k)),
            },
            Section::Positions => match k.as_str() {
                "autoRecalculate" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                "debounceMs" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 60_000)?));
                }
                _ => return Err(format!("unknown positions field: {}", k)),
            },
        }
    }
    Ok(())
}

pub fn load_section(conn: &Connection, section: Section) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults field by field.
            for (k, v) in saved_obj {
                let mut one = Map::new();
                one.insert(k.clone(), v.clone());
                if let Err(e) = merge_section_patch(section, &mut current, &one) {
                    warn!(section = section.name(), field = %k, error = %e, "ignoring stored setting");
                }
            }
        }
    }
    Ok(current)
}

/// Validates `patch` against the section and stores the merged result.
pub fn update_section(
    conn: &Connection,
    section: Section,
    patch: &Map<String, Value>,
) -> Result<Value, SettingsError> {
    let mut current = load_section(conn, section).map_err(SettingsError::Storage)?;
    merge_section_patch(section, &mut current, patch).map_err(SettingsError::Invalid)?;
    db::settings_set_json(conn, section.key(), &current).map_err(SettingsError::Storage)?;
    Ok(current)
}

#[derive(Debug)]
pub enum SettingsError {
    Invalid(String),
    Storage(anyhow::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradingSettings {
    pub default_curriculum: CurriculumKind,
    pub default_academic_year: String,
    pub options: GradingOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionsSettings {
    pub auto_recalculate: bool,
    pub debounce_ms: u64,
}

pub fn grading(conn: &Connection) -> anyhow::Result<GradingSettings> {
    let v = load_section(conn, Section::Grading)?;
    let str_field = |k: &str| v.get(k).and_then(|x| x.as_str()).unwrap_or("");
    let defaults = GradingOptions::default();
    Ok(GradingSettings {
        default_curriculum: CurriculumKind::parse(str_field("defaultCurriculum"))
            .unwrap_or(CurriculumKind::Standard),
        default_academic_year: str_field("defaultAcademicYear").to_string(),
        options: GradingOptions {
            rank_policy: RankPolicy::parse(str_field("rankPolicy")).unwrap_or(defaults.rank_policy),
            out_of_range: OutOfRangePolicy::parse(str_field("outOfRangePolicy"))
                .unwrap_or(defaults.out_of_range),
            igcse_coursework_weight: v
                .get("igcseCourseworkWeight")
                .and_then(|x| x.as_i64())
                .map(|n| n as f64)
                .unwrap_or(defaults.igcse_coursework_weight),
        },
    })
}

pub fn positions(conn: &Connection) -> anyhow::Result<PositionsSettings> {
    let v = load_section(conn, Section::Positions)?;
    Ok(PositionsSettings {
        auto_recalculate: v
            .get("autoRecalculate")
            .and_then(|x| x.as_bool())
            .unwrap_or(true),
        debounce_ms: v
            .get("debounceMs")
            .and_then(|x| x.as_u64())
            .unwrap_or(2000),
    })
}
