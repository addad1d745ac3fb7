use serde::{Deserialize, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Whole-number rounding used for every percentage and average:
/// `floor(x + 0.5)`, i.e. half up for the non-negative values we produce.
pub fn round_half_up(x: f64) -> i64 {
    (x + 0.5).floor() as i64
}

/// 1-decimal variant of [`round_half_up`], used for statistics.
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

pub fn in_score_range(v: f64) -> bool {
    v.is_finite() && (0.0..=100.0).contains(&v)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurriculumKind {
    Standard,
    Cbc,
    Igcse,
}

impl CurriculumKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Some(Self::Standard),
            "cbc" | "competency" => Some(Self::Cbc),
            "igcse" => Some(Self::Igcse),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Cbc => "cbc",
            Self::Igcse => "igcse",
        }
    }

    pub fn bands(self) -> &'static [GradeBand] {
        match self {
            Self::Standard => STANDARD_BANDS,
            Self::Cbc => CBC_BANDS,
            Self::Igcse => IGCSE_BANDS,
        }
    }

    /// Derives percentage and grade for an in-range raw score.
    ///
    /// Letter schemes band on the rounded percentage; CBC bands on the raw
    /// marks.
    pub fn mark(self, raw: f64) -> Mark {
        let percentage = round_half_up(raw);
        let basis = match self {
            Self::Standard | Self::Igcse => percentage as f64,
            Self::Cbc => raw,
        };
        Mark {
            score: raw,
            percentage,
            grade: band_lookup(self.bands(), basis),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LetterGrade {
    APlus,
    A,
    BPlus,
    B,
    CPlus,
    C,
    DPlus,
    D,
    E,
}

impl LetterGrade {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::APlus => "A+",
            Self::A => "A",
            Self::BPlus => "B+",
            Self::B => "B",
            Self::CPlus => "C+",
            Self::C => "C",
            Self::DPlus => "D+",
            Self::D => "D",
            Self::E => "E",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PerformanceLevel {
    Emerging,
    Approaching,
    Proficient,
    Exemplary,
}

impl PerformanceLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "emerging" => Some(Self::Emerging),
            "approaching" => Some(Self::Approaching),
            "proficient" => Some(Self::Proficient),
            "exemplary" => Some(Self::Exemplary),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Emerging => "Emerging",
            Self::Approaching => "Approaching",
            Self::Proficient => "Proficient",
            Self::Exemplary => "Exemplary",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IgcseGrade {
    AStar,
    A,
    B,
    C,
    D,
    E,
    F,
    G,
    U,
}

impl IgcseGrade {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AStar => "A*",
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
            Self::E => "E",
            Self::F => "F",
            Self::G => "G",
            Self::U => "U",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Grade {
    Letter(LetterGrade),
    Level(PerformanceLevel),
    Igcse(IgcseGrade),
}

impl Grade {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Letter(g) => g.as_str(),
            Self::Level(l) => l.as_str(),
            Self::Igcse(g) => g.as_str(),
        }
    }

    /// Value for the `letter_grade` column.
    pub fn letter(self) -> Option<&'static str> {
        match self {
            Self::Letter(_) | Self::Igcse(_) => Some(self.as_str()),
            Self::Level(_) => None,
        }
    }

    /// Value for the `performance_level` column.
    pub fn level(self) -> Option<&'static str> {
        match self {
            Self::Level(l) => Some(l.as_str()),
            _ => None,
        }
    }
}

impl Serialize for Grade {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Lower bound (inclusive) of a grade band. Tables are ordered highest first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradeBand {
    pub min: f64,
    pub grade: Grade,
}

const fn letter(min: f64, g: LetterGrade) -> GradeBand {
    GradeBand {
        min,
        grade: Grade::Letter(g),
    }
}

const fn level(min: f64, l: PerformanceLevel) -> GradeBand {
    GradeBand {
        min,
        grade: Grade::Level(l),
    }
}

const fn igcse(min: f64, g: IgcseGrade) -> GradeBand {
    GradeBand {
        min,
        grade: Grade::Igcse(g),
    }
}

const STANDARD_BANDS: &[GradeBand] = &[
    letter(90.0, LetterGrade::APlus),
    letter(80.0, LetterGrade::A),
    letter(70.0, LetterGrade::BPlus),
    letter(60.0, LetterGrade::B),
    letter(50.0, LetterGrade::CPlus),
    letter(40.0, LetterGrade::C),
    letter(30.0, LetterGrade::DPlus),
    letter(20.0, LetterGrade::D),
    letter(0.0, LetterGrade::E),
];

const CBC_BANDS: &[GradeBand] = &[
    level(80.0, PerformanceLevel::Exemplary),
    level(60.0, PerformanceLevel::Proficient),
    level(40.0, PerformanceLevel::Approaching),
    level(0.0, PerformanceLevel::Emerging),
];

const IGCSE_BANDS: &[GradeBand] = &[
    igcse(90.0, IgcseGrade::AStar),
    igcse(80.0, IgcseGrade::A),
    igcse(70.0, IgcseGrade::B),
    igcse(60.0, IgcseGrade::C),
    igcse(50.0, IgcseGrade::D),
    igcse(40.0, IgcseGrade::E),
    igcse(30.0, IgcseGrade::F),
    igcse(20.0, IgcseGrade::G),
    igcse(0.0, IgcseGrade::U),
];

fn band_lookup(bands: &[GradeBand], basis: f64) -> Grade {
    bands
        .iter()
        .find(|b| basis >= b.min)
        .or_else(|| bands.last())
        .map(|b| b.grade)
        .unwrap_or(Grade::Letter(LetterGrade::E))
}

/// A present score with its derived fields. These only ever exist together.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Mark {
    pub score: f64,
    pub percentage: i64,
    pub grade: Grade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RankPolicy {
    /// Rank is the index in the sorted cohort; equal percentages keep roster order.
    Position,
    /// Equal percentages share a rank; the following ranks are skipped.
    Competition,
}

impl RankPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "position" => Some(Self::Position),
            "competition" => Some(Self::Competition),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Position => "position",
            Self::Competition => "competition",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentSummary {
    pub student_id: String,
    pub total: f64,
    pub scored_count: usize,
    pub percentage: i64,
    pub average: i64,
    pub rank: Option<usize>,
}

/// Per-student totals and cohort rank.
///
/// `cohort` must be in roster order: that order breaks ties under
/// [`RankPolicy::Position`]. Students with no scores get percentage 0,
/// average 0 and no rank.
pub fn summarize<'a, I>(cohort: I, policy: RankPolicy) -> Vec<StudentSummary>
where
    I: IntoIterator<Item = (&'a str, Vec<f64>)>,
{
    let mut out: Vec<StudentSummary> = cohort
        .into_iter()
        .map(|(student_id, scores)| {
            let scored_count = scores.len();
            let total: f64 = scores.iter().sum();
            let (percentage, average) = if scored_count > 0 {
                let count = scored_count as f64;
                (
                    round_half_up(100.0 * total / (100.0 * count)),
                    round_half_up(total / count),
                )
            } else {
                (0, 0)
            };
            StudentSummary {
                student_id: student_id.to_string(),
                total,
                scored_count,
                percentage,
                average,
                rank: None,
            }
        })
        .collect();

    let mut order: Vec<usize> = (0..out.len())
        .filter(|&i| out[i].scored_count > 0)
        .collect();
    // sort_by is stable: ties stay in roster order.
    order.sort_by(|&a, &b| out[b].percentage.cmp(&out[a].percentage));

    match policy {
        RankPolicy::Position => {
            for (pos, &i) in order.iter().enumerate() {
                out[i].rank = Some(pos + 1);
            }
        }
        RankPolicy::Competition => {
            let mut prev: Option<i64> = None;
            let mut rank = 0;
            for (pos, &i) in order.iter().enumerate() {
                if prev != Some(out[i].percentage) {
                    rank = pos + 1;
                    prev = Some(out[i].percentage);
                }
                out[i].rank = Some(rank);
            }
        }
    }

    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectStats {
    pub subject_id: String,
    pub scored_count: usize,
    pub average: f64,
    pub median: f64,
    pub highest: Option<f64>,
    pub lowest: Option<f64>,
    pub grade_counts: BTreeMap<String, usize>,
}

pub fn compute_median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[(n / 2) - 1] + sorted[n / 2]) / 2.0
    }
}

pub fn subject_stats(subject_id: &str, marks: &[Mark]) -> SubjectStats {
    let scores: Vec<f64> = marks.iter().map(|m| m.score).collect();
    let mut grade_counts: BTreeMap<String, usize> = BTreeMap::new();
    for m in marks {
        *grade_counts.entry(m.grade.as_str().to_string()).or_insert(0) += 1;
    }
    let average = if scores.is_empty() {
        0.0
    } else {
        round_off_1_decimal(scores.iter().sum::<f64>() / scores.len() as f64)
    };
    SubjectStats {
        subject_id: subject_id.to_string(),
        scored_count: scores.len(),
        average,
        median: compute_median(&scores),
        highest: scores.iter().copied().reduce(f64::max),
        lowest: scores.iter().copied().reduce(f64::min),
        grade_counts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cohort(rows: &[(&'static str, &[f64])]) -> Vec<(&'static str, Vec<f64>)> {
        rows.iter().map(|(id, s)| (*id, s.to_vec())).collect()
    }

    fn letter_for(p: i64) -> &'static str {
        CurriculumKind::Standard.mark(p as f64).grade.as_str()
    }

    #[test]
    fn round_half_up_matches_plain_rounding_for_non_negative() {
        assert_eq!(round_half_up(87.5), 88);
        assert_eq!(round_half_up(87.49), 87);
        assert_eq!(round_half_up(0.0), 0);
        assert_eq!(round_half_up(99.5), 100);
        assert_eq!(round_off_1_decimal(35.6818), 35.7);
    }

    #[test]
    fn every_percentage_hits_exactly_one_standard_band() {
        for p in 0..=100_i64 {
            let expected = match p {
                90..=100 => "A+",
                80..=89 => "A",
                70..=79 => "B+",
                60..=69 => "B",
                50..=59 => "C+",
                40..=49 => "C",
                30..=39 => "D+",
                20..=29 => "D",
                _ => "E",
            };
            assert_eq!(letter_for(p), expected, "percentage {}", p);
        }
        assert_eq!(letter_for(90), "A+");
        assert_eq!(letter_for(89), "A");
    }

    #[test]
    fn standard_bands_on_rounded_percentage() {
        let m = CurriculumKind::Standard.mark(89.5);
        assert_eq!(m.percentage, 90);
        assert_eq!(m.grade, Grade::Letter(LetterGrade::APlus));
    }

    #[test]
    fn cbc_bands_on_raw_marks() {
        let cases = [
            (100.0, PerformanceLevel::Exemplary),
            (80.0, PerformanceLevel::Exemplary),
            (79.9, PerformanceLevel::Proficient),
            (60.0, PerformanceLevel::Proficient),
            (59.5, PerformanceLevel::Approaching),
            (40.0, PerformanceLevel::Approaching),
            (39.0, PerformanceLevel::Emerging),
            (0.0, PerformanceLevel::Emerging),
        ];
        for (raw, lvl) in cases {
            let m = CurriculumKind::Cbc.mark(raw);
            assert_eq!(m.grade, Grade::Level(lvl), "raw {}", raw);
            assert_eq!(m.grade.level(), Some(lvl.as_str()));
            assert_eq!(m.grade.letter(), None);
        }
    }

    #[test]
    fn igcse_bands() {
        assert_eq!(CurriculumKind::Igcse.mark(90.0).grade.as_str(), "A*");
        assert_eq!(CurriculumKind::Igcse.mark(61.0).grade.as_str(), "C");
        assert_eq!(CurriculumKind::Igcse.mark(19.0).grade.as_str(), "U");
        assert_eq!(CurriculumKind::Igcse.mark(55.0).grade.letter(), Some("D"));
    }

    #[test]
    fn curriculum_parse_roundtrips_names() {
        for k in [CurriculumKind::Standard, CurriculumKind::Cbc, CurriculumKind::Igcse] {
            assert_eq!(CurriculumKind::parse(k.as_str()), Some(k));
        }
        assert_eq!(CurriculumKind::parse("Competency"), Some(CurriculumKind::Cbc));
        assert_eq!(CurriculumKind::parse("ib"), None);
    }

    #[test]
    fn summary_matches_reference_sheet() {
        let s = summarize(
            cohort(&[("a", &[90.0, 85.0]), ("b", &[75.0, 75.0]), ("c", &[60.0])]),
            RankPolicy::Position,
        );
        assert_eq!(s[0].percentage, 88);
        assert_eq!(s[0].average, 88);
        assert_eq!(s[0].total, 175.0);
        assert_eq!(s[0].rank, Some(1));
        assert_eq!(s[1].percentage, 75);
        assert_eq!(s[1].rank, Some(2));
        assert_eq!(s[2].percentage, 60);
        assert_eq!(s[2].scored_count, 1);
        assert_eq!(s[2].rank, Some(3));
    }

    #[test]
    fn ties_keep_roster_order_without_sharing() {
        let s = summarize(
            cohort(&[("x", &[50.0]), ("a", &[75.0]), ("b", &[75.0])]),
            RankPolicy::Position,
        );
        assert_eq!(s[1].rank, Some(1));
        assert_eq!(s[2].rank, Some(2));
        assert_eq!(s[0].rank, Some(3));
    }

    #[test]
    fn competition_ranking_shares_and_skips() {
        let s = summarize(
            cohort(&[("a", &[75.0]), ("b", &[75.0]), ("c", &[50.0])]),
            RankPolicy::Competition,
        );
        assert_eq!(s[0].rank, Some(1));
        assert_eq!(s[1].rank, Some(1));
        assert_eq!(s[2].rank, Some(3));
    }

    #[test]
    fn unscored_students_are_never_ranked() {
        let s = summarize(
            cohort(&[("empty", &[]), ("a", &[10.0]), ("empty2", &[])]),
            RankPolicy::Position,
        );
        assert_eq!(s[0].rank, None);
        assert_eq!(s[0].percentage, 0);
        assert_eq!(s[0].average, 0);
        assert_eq!(s[1].rank, Some(1));
        assert_eq!(s[2].rank, None);

        let lone = summarize(cohort(&[("only", &[])]), RankPolicy::Competition);
        assert_eq!(lone[0].rank, None);
    }

    #[test]
    fn summarize_is_idempotent() {
        let input = cohort(&[("a", &[40.0, 80.0]), ("b", &[60.0]), ("c", &[60.0, 60.0])]);
        let first = summarize(input.clone(), RankPolicy::Position);
        let second = summarize(input, RankPolicy::Position);
        assert_eq!(first, second);
    }

    #[test]
    fn subject_stats_reports_spread_and_distribution() {
        let marks: Vec<Mark> = [90.0, 75.0, 60.0, 75.0]
            .iter()
            .map(|v| CurriculumKind::Standard.mark(*v))
            .collect();
        let st = subject_stats("math", &marks);
        assert_eq!(st.scored_count, 4);
        assert_eq!(st.average, 75.0);
        assert_eq!(st.median, 75.0);
        assert_eq!(st.highest, Some(90.0));
        assert_eq!(st.lowest, Some(60.0));
        assert_eq!(st.grade_counts.get("B+"), Some(&2));
        assert_eq!(st.grade_counts.get("A+"), Some(&1));

        let empty = subject_stats("none", &[]);
        assert_eq!(empty.highest, None);
        assert_eq!(empty.average, 0.0);
    }
}
