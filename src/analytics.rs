//! Rollups over completed feedback: averages, keywords, excerpts and
//! training suggestions.

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeSet;

use crate::db::Database;
use crate::models::{Feedback, Ratings};

/// Competency averages below this (on the 1-10 scale) earn a training suggestion.
pub const TRAINING_THRESHOLD: f64 = 7.0;

const MAX_KEYWORDS: usize = 7;
const STRENGTH_COUNT: usize = 3;
const IMPROVEMENT_COUNT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Competency {
    Teamwork,
    Communication,
    Initiative,
    TechnicalSkills,
    ProblemSolving,
}

impl Competency {
    pub const ALL: [Competency; 5] = [
        Competency::Teamwork,
        Competency::Communication,
        Competency::Initiative,
        Competency::TechnicalSkills,
        Competency::ProblemSolving,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Competency::Teamwork => "Teamwork",
            Competency::Communication => "Communication",
            Competency::Initiative => "Initiative",
            Competency::TechnicalSkills => "Technical Skills",
            Competency::ProblemSolving => "Problem Solving",
        }
    }

    pub fn training(&self) -> &'static str {
        match self {
            Competency::Teamwork => "Effective teamwork and collaboration workshop",
            Competency::Communication => "Public speaking and communication skills training",
            Competency::Initiative => "Proactivity and ownership seminar",
            Competency::TechnicalSkills => "Specialised technical courses for your field",
            Competency::ProblemSolving => "Critical thinking and problem-solving lab",
        }
    }

    fn score(&self, feedback: &Feedback) -> i64 {
        match self {
            Competency::Teamwork => feedback.teamwork_rating,
            Competency::Communication => feedback.communication_rating,
            Competency::Initiative => feedback.initiative_rating,
            Competency::TechnicalSkills => feedback.technical_skills_rating,
            Competency::ProblemSolving => feedback.problem_solving_rating,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompetencyScore {
    pub name: &'static str,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingRecommendation {
    pub competency: &'static str,
    pub training: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserStats {
    pub overall_avg_rating: f64,
    pub received_feedback_count: usize,
    pub all_keywords: Vec<String>,
    pub competencies: Vec<CompetencyScore>,
    pub strengths: Vec<String>,
    pub improvements: Vec<String>,
    pub recommended_trainings: Vec<TrainingRecommendation>,
}

pub struct FeedbackAnalytics;

impl FeedbackAnalytics {
    /// Stats over the completed feedback `user_id` asked for.
    pub fn user_stats(db: &Database, user_id: i64) -> Result<UserStats> {
        let feedback = db.completed_feedback_about(user_id)?;
        Ok(Self::summarize(&feedback))
    }

    pub fn summarize(feedback: &[Feedback]) -> UserStats {
        let overall = mean(feedback.iter().map(|f| f.rating)).map(round2).unwrap_or(0.0);

        let competencies: Vec<CompetencyScore> = Competency::ALL
            .iter()
            .map(|c| CompetencyScore {
                name: c.label(),
                score: mean(feedback.iter().map(|f| c.score(f))).map(round2).unwrap_or(0.0),
            })
            .collect();

        let recommended_trainings = Competency::ALL
            .iter()
            .zip(&competencies)
            .filter(|(_, scored)| scored.score < TRAINING_THRESHOLD)
            .map(|(c, _)| TrainingRecommendation {
                competency: c.label(),
                training: c.training(),
            })
            .collect();

        let texts: Vec<String> = feedback.iter().map(|f| f.feedback.clone()).collect();

        UserStats {
            overall_avg_rating: overall,
            received_feedback_count: feedback.len(),
            all_keywords: collect_keywords(feedback.iter().map(|f| f.keywords.as_str())),
            competencies,
            strengths: texts.iter().take(STRENGTH_COUNT).cloned().collect(),
            improvements: texts
                .iter()
                .skip(STRENGTH_COUNT)
                .take(IMPROVEMENT_COUNT)
                .cloned()
                .collect(),
            recommended_trainings,
        }
    }

    /// Unrounded averages of every rating dimension; `None` without data.
    pub fn average_ratings(feedback: &[Feedback]) -> Ratings {
        let avg = |c: Competency| mean(feedback.iter().map(|f| c.score(f)));
        Ratings {
            rating: mean(feedback.iter().map(|f| f.rating)),
            teamwork: avg(Competency::Teamwork),
            communication: avg(Competency::Communication),
            initiative: avg(Competency::Initiative),
            technical_skills: avg(Competency::TechnicalSkills),
            problem_solving: avg(Competency::ProblemSolving),
        }
    }
}

/// Comma-split, trimmed, non-empty pieces of one keyword string.
pub fn split_keywords(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Exact-match deduplicated keywords across entries, capped at seven.
pub fn collect_keywords<'a>(inputs: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let unique: BTreeSet<String> = inputs.into_iter().flat_map(split_keywords).collect();
    unique.into_iter().take(MAX_KEYWORDS).collect()
}

fn mean(values: impl Iterator<Item = i64>) -> Option<f64> {
    let (sum, count) = values.fold((0i64, 0usize), |(s, n), v| (s + v, n + 1));
    if count == 0 {
        None
    } else {
        Some(sum as f64 / count as f64)
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
