use crate::calendar::{self, WorkingDay};
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap, HashSet};

const SAME_SUBJECT_POINTS: f64 = 100.0;
const FEWEST_CLASSES_POINTS: f64 = 50.0;
const FEWEST_SUBSTITUTIONS_POINTS: f64 = 30.0;
const MAX_ALTERNATES: usize = 4;

/// One lesson occurrence the absent teacher would have taught.
#[derive(Debug, Clone)]
pub struct Lesson {
    pub entry_id: String,
    pub class_name: String,
    pub subject: String,
    pub day_id: String,
    pub day_name: String,
    /// Canonical weekday resolved at import time; None when the imported
    /// day name matched no known weekday.
    pub weekday: Option<u32>,
    pub period_id: String,
    pub period_number: i64,
}

/// One row of the timetable as read from storage, in display order.
#[derive(Debug, Clone)]
pub struct ScheduleRow {
    pub teacher_key: String,
    pub lesson: Lesson,
}

/// Per-candidate facts gathered before scoring. `weekly_lessons`,
/// `subjects` and `occupied` come from the timetable itself;
/// `substitution_count` and `busy_slots` come from persisted assignments
/// overlapping the requested window and are zero/empty for unmapped
/// candidates.
#[derive(Debug, Clone, Default)]
pub struct CandidateStats {
    pub teacher_id: Option<String>,
    pub weekly_lessons: i64,
    pub subjects: HashSet<String>,
    pub occupied: HashSet<(String, String)>,
    pub substitution_count: i64,
    pub busy_slots: HashSet<(String, String)>,
}

/// Which ranking criteria are in effect for one calculation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Criteria {
    pub same_subject: bool,
    pub fewest_classes: bool,
    pub fewest_substitutions: bool,
    pub no_conflict: bool,
}

impl Criteria {
    /// Enables the named criterion; false for an unknown name.
    pub fn enable(&mut self, name: &str) -> bool {
        match name {
            "same_subject" => self.same_subject = true,
            "fewest_classes" => self.fewest_classes = true,
            "fewest_substitutions" => self.fewest_substitutions = true,
            "no_conflict" => self.no_conflict = true,
            _ => return false,
        }
        true
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.same_subject {
            out.push("same_subject");
        }
        if self.fewest_classes {
            out.push("fewest_classes");
        }
        if self.fewest_substitutions {
            out.push("fewest_substitutions");
        }
        if self.no_conflict {
            out.push("no_conflict");
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScoreBreakdown {
    pub same_subject: f64,
    pub fewest_classes: f64,
    pub fewest_substitutions: f64,
}

impl ScoreBreakdown {
    pub fn total(&self) -> f64 {
        self.same_subject + self.fewest_classes + self.fewest_substitutions
    }
}

#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub teacher_key: String,
    pub teacher_id: Option<String>,
    pub breakdown: ScoreBreakdown,
    /// Effective counts at ranking time, in-run increments included.
    pub weekly_lessons: i64,
    pub substitution_count: i64,
}

#[derive(Debug, Clone)]
pub struct LessonPlan {
    pub lesson: Lesson,
    pub primary: Option<RankedCandidate>,
    pub alternates: Vec<RankedCandidate>,
}

/// Index over one timetable for one absence: the absent teacher's lessons
/// in timetable order, and the candidate pool keyed by opaque teacher key.
/// BTreeMap keeps candidate iteration deterministic.
#[derive(Debug, Default)]
pub struct ScheduleIndex {
    pub absent_lessons: Vec<Lesson>,
    pub candidates: BTreeMap<String, CandidateStats>,
}

impl ScheduleIndex {
    pub fn build(rows: &[ScheduleRow], absent_teacher_key: &str) -> ScheduleIndex {
        let mut index = ScheduleIndex::default();
        for row in rows {
            if row.teacher_key == absent_teacher_key {
                index.absent_lessons.push(row.lesson.clone());
                continue;
            }
            let stats = index.candidates.entry(row.teacher_key.clone()).or_default();
            stats.weekly_lessons += 1;
            stats.subjects.insert(row.lesson.subject.clone());
            stats
                .occupied
                .insert((row.lesson.day_id.clone(), row.lesson.period_id.clone()));
        }
        index
    }
}

/// In-run load deltas threaded through one scoring pass. Selecting a
/// primary bumps both counters so later lessons in the same calculation
/// discourage (not forbid) reselecting an already-burdened teacher.
#[derive(Debug, Default)]
pub struct RunCounters {
    weekly: HashMap<String, i64>,
    substitutions: HashMap<String, i64>,
}

impl RunCounters {
    pub fn effective_weekly(&self, teacher_key: &str, base: i64) -> i64 {
        base + self.weekly.get(teacher_key).copied().unwrap_or(0)
    }

    pub fn effective_substitutions(&self, teacher_key: &str, base: i64) -> i64 {
        base + self.substitutions.get(teacher_key).copied().unwrap_or(0)
    }

    pub fn record_selection(&mut self, teacher_key: &str) {
        *self.weekly.entry(teacher_key.to_string()).or_insert(0) += 1;
        *self
            .substitutions
            .entry(teacher_key.to_string())
            .or_insert(0) += 1;
    }
}

/// Ranks and selects a substitute for every absent lesson. A lesson with
/// no eligible candidate yields primary=None with empty alternates.
pub fn plan_lessons(index: &ScheduleIndex, criteria: Criteria) -> Vec<LessonPlan> {
    let mut counters = RunCounters::default();
    let mut plans = Vec::with_capacity(index.absent_lessons.len());
    for lesson in &index.absent_lessons {
        let mut ranked = rank_candidates(lesson, &index.candidates, criteria, &counters);
        let mut plan = LessonPlan {
            lesson: lesson.clone(),
            primary: None,
            alternates: Vec::new(),
        };
        if !ranked.is_empty() {
            let rest = ranked.split_off(1);
            let top = ranked.remove(0);
            counters.record_selection(&top.teacher_key);
            plan.primary = Some(top);
            plan.alternates = rest.into_iter().take(MAX_ALTERNATES).collect();
        }
        plans.push(plan);
    }
    plans
}

fn rank_candidates(
    lesson: &Lesson,
    candidates: &BTreeMap<String, CandidateStats>,
    criteria: Criteria,
    counters: &RunCounters,
) -> Vec<RankedCandidate> {
    let slot = (lesson.day_id.clone(), lesson.period_id.clone());

    // Eligibility is a hard filter; scoring maxima are taken over the
    // population that actually gets scored.
    let eligible: Vec<(&String, &CandidateStats, i64, i64)> = candidates
        .iter()
        .filter(|(_, stats)| {
            if !criteria.no_conflict {
                return true;
            }
            !stats.occupied.contains(&slot) && !stats.busy_slots.contains(&slot)
        })
        .map(|(key, stats)| {
            let weekly = counters.effective_weekly(key, stats.weekly_lessons);
            let subs = counters.effective_substitutions(key, stats.substitution_count);
            (key, stats, weekly, subs)
        })
        .collect();

    let max_weekly = eligible.iter().map(|(_, _, w, _)| *w).max().unwrap_or(0);
    let max_subs = eligible.iter().map(|(_, _, _, s)| *s).max().unwrap_or(0);

    let mut ranked: Vec<RankedCandidate> = eligible
        .into_iter()
        .map(|(key, stats, weekly, subs)| {
            let mut breakdown = ScoreBreakdown::default();
            if criteria.same_subject && stats.subjects.contains(&lesson.subject) {
                breakdown.same_subject = SAME_SUBJECT_POINTS;
            }
            if criteria.fewest_classes && max_weekly > 0 {
                breakdown.fewest_classes =
                    (1.0 - weekly as f64 / max_weekly as f64) * FEWEST_CLASSES_POINTS;
            }
            if criteria.fewest_substitutions {
                let denom = max_subs.max(1) as f64;
                breakdown.fewest_substitutions =
                    (1.0 - subs as f64 / denom) * FEWEST_SUBSTITUTIONS_POINTS;
            }
            RankedCandidate {
                teacher_key: key.clone(),
                teacher_id: stats.teacher_id.clone(),
                breakdown,
                weekly_lessons: weekly,
                substitution_count: subs,
            }
        })
        .collect();

    // Highest score first; equal scores fall back to teacher key ascending
    // so repeated calculations return identical rankings.
    ranked.sort_by(|a, b| {
        b.breakdown
            .total()
            .partial_cmp(&a.breakdown.total())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.teacher_key.cmp(&b.teacher_key))
    });
    ranked
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatedLesson {
    pub entry_id: String,
    pub date: NaiveDate,
}

#[derive(Debug, Default)]
pub struct Expansion {
    pub dated: Vec<DatedLesson>,
    /// Human-readable reasons for lessons dropped from expansion.
    pub skipped: Vec<String>,
}

/// Fans weekly lesson plans out onto the resolved working days. A lesson
/// fans into one dated entry per working day sharing its weekday; zero
/// matches in range is a valid outcome. A lesson whose day name resolves
/// to no weekday at all is dropped with a diagnostic rather than guessed.
pub fn expand_plans(plans: &[LessonPlan], working_days: &[WorkingDay]) -> Expansion {
    let mut expansion = Expansion::default();
    for plan in plans {
        let lesson = &plan.lesson;
        let weekday = lesson
            .weekday
            .or_else(|| calendar::weekday_from_name(&lesson.day_name));
        let Some(weekday) = weekday else {
            expansion.skipped.push(format!(
                "lesson {} day '{}' matches no known weekday",
                lesson.entry_id, lesson.day_name
            ));
            continue;
        };
        for day in working_days.iter().filter(|d| d.weekday == weekday) {
            expansion.dated.push(DatedLesson {
                entry_id: lesson.entry_id.clone(),
                date: day.date,
            });
        }
    }
    expansion
}
