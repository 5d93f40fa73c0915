//! Demo data: one company full of colleagues who have already reviewed
//! each other.

use anyhow::{bail, Result};
use chrono::{Duration, Local};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info};

use crate::auth::hash_password;
use crate::db::{Database, NewUser};
use crate::models::NewFeedback;

pub const DEMO_PASSWORD: &str = "password123";

const TRAITS: [&str; 10] = [
    "Communicative",
    "Proactive",
    "Responsible",
    "Fast",
    "Thorough",
    "Leader",
    "Analytical",
    "Flexible",
    "Innovative",
    "Empathetic",
];

const FIRST_NAMES: [&str; 16] = [
    "Ona", "Jonas", "Greta", "Lukas", "Ieva", "Matas", "Austėja", "Domas", "Emilija", "Nojus",
    "Gabija", "Kajus", "Urtė", "Jokūbas", "Kamilė", "Benas",
];

const LAST_NAMES: [&str; 12] = [
    "Kazlauskas", "Petraitis", "Jankauskas", "Stankevičius", "Vasiliauskas", "Žukauskas",
    "Butkus", "Paulauskas", "Urbonas", "Kavaliauskas", "Navickas", "Ramanauskas",
];

const COMMENTS: [&str; 6] = [
    "Delivered the sprint goals without drama.",
    "Could share progress earlier with the rest of the team.",
    "Very helpful during the release week.",
    "Asks good questions in planning.",
    "Sometimes takes on too much at once.",
    "Reviews are careful and kind.",
];

const NARRATIVES: [&str; 6] = [
    "Consistently reliable on the projects we shared and quick to unblock others when things got stuck.",
    "Brought structure to a messy migration and kept stakeholders informed throughout.",
    "Strong technically, and would have even more impact by speaking up earlier in design discussions.",
    "A calm presence during incidents; the post-mortems were clear and actionable.",
    "Took ownership of the onboarding docs without being asked, which saved the new hires a lot of time.",
    "Good collaborator who could push back more when scope starts to creep.",
];

const QUESTIONNAIRE_TITLE: &str = "360 Degree Annual Review";

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SeedSummary {
    pub company_id: i64,
    pub users: usize,
    pub questionnaires: usize,
    pub feedback: usize,
}

fn pick<'a, R: Rng>(rng: &mut R, items: &[&'a str]) -> &'a str {
    items.choose(rng).copied().unwrap_or_default()
}

fn pick_rating<R: Rng>(rng: &mut R, choices: &[i64]) -> i64 {
    choices.choose(rng).copied().unwrap_or(5)
}

/// Ratings skewed towards the upper half of the 1-10 scale.
fn random_feedback<R: Rng>(rng: &mut R) -> NewFeedback {
    let keyword_count = rng.gen_range(1..=4);
    let keywords: Vec<&str> = TRAITS.choose_multiple(rng, keyword_count).copied().collect();

    NewFeedback {
        rating: pick_rating(rng, &[6, 8, 8, 10, 10]),
        teamwork_rating: pick_rating(rng, &[6, 8, 10]),
        communication_rating: pick_rating(rng, &[4, 6, 8, 10]),
        initiative_rating: pick_rating(rng, &[4, 6, 8]),
        technical_skills_rating: pick_rating(rng, &[6, 8, 10]),
        problem_solving_rating: pick_rating(rng, &[6, 8, 10]),
        keywords: keywords.join(", "),
        comments: pick(rng, &COMMENTS).to_string(),
        feedback: pick(rng, &NARRATIVES).to_string(),
        trait_ratings: vec![],
    }
}

fn unique_username<R: Rng>(db: &Database, rng: &mut R, first: &str, last: &str) -> Result<String> {
    loop {
        let candidate = format!(
            "{}.{}{}",
            first.to_lowercase(),
            last.to_lowercase(),
            rng.gen_range(1..=99_999)
        );
        if !db.username_taken(&candidate)? {
            return Ok(candidate);
        }
    }
}

pub fn seed<R: Rng>(db: &Database, rng: &mut R, user_count: usize, company: &str) -> Result<SeedSummary> {
    if user_count < 2 {
        bail!("Need at least 2 users so they can review each other");
    }

    let company_id = db.get_or_create_company(company)?;
    let mut trait_ids = Vec::with_capacity(TRAITS.len());
    for name in TRAITS {
        trait_ids.push(db.get_or_create_trait(name)?);
    }

    // Every demo account shares a password, so hash it once
    let password_hash = hash_password(DEMO_PASSWORD)?;
    let domain: String = company
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase();

    let mut users = Vec::with_capacity(user_count);
    for _ in 0..user_count {
        let first = pick(rng, &FIRST_NAMES);
        let last = pick(rng, &LAST_NAMES);
        let username = unique_username(db, rng, first, last)?;
        let id = db.create_user(&NewUser {
            email: format!("{}@{}.example", username, domain),
            username,
            first_name: first.to_string(),
            last_name: last.to_string(),
            password_hash: password_hash.clone(),
            is_superuser: false,
        })?;
        db.create_profile(id, Some(company_id))?;
        users.push(id);
    }
    debug!(count = users.len(), "demo users created");

    let today = Local::now().date_naive();
    let mut summary = SeedSummary {
        company_id,
        users: users.len(),
        ..Default::default()
    };

    for &user_id in &users {
        let chosen: Vec<i64> = trait_ids.choose_multiple(rng, 5).copied().collect();
        db.create_questionnaire(QUESTIONNAIRE_TITLE, user_id, &chosen)?;
        summary.questionnaires += 1;

        let reviewers: Vec<i64> = users.iter().copied().filter(|&u| u != user_id).collect();
        let wanted = rng.gen_range(10..=20).min(reviewers.len());
        for &reviewer in reviewers.choose_multiple(rng, wanted) {
            let days_ago = rng.gen_range(1..=365);
            let due = today - Duration::days(days_ago) + Duration::days(14);
            let feedback = random_feedback(rng);
            db.record_unsolicited_feedback(reviewer, user_id, QUESTIONNAIRE_TITLE, due, &feedback)?;
            summary.feedback += 1;
        }
    }

    info!(
        company_id,
        users = summary.users,
        feedback = summary.feedback,
        "demo data generated"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::FeedbackAnalytics;
    use crate::auth::verify_password;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_seed_small_company() {
        let db = Database::open_in_memory().unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let summary = seed(&db, &mut rng, 4, "PowerUp Demo").unwrap();

        assert_eq!(summary.users, 4);
        assert_eq!(summary.questionnaires, 4);
        // Only three possible reviewers each
        assert_eq!(summary.feedback, 12);

        let employees = db.list_employees(Some(summary.company_id)).unwrap();
        assert_eq!(employees.len(), 4);
        assert!(verify_password(DEMO_PASSWORD, &employees[0].user.password_hash));
        assert_eq!(db.list_traits().unwrap().len(), 10);

        let stats = FeedbackAnalytics::user_stats(&db, employees[0].user.id).unwrap();
        assert_eq!(stats.received_feedback_count, 3);
        assert!(stats.overall_avg_rating >= 6.0 && stats.overall_avg_rating <= 10.0);
        assert!(!stats.all_keywords.is_empty());
    }

    #[test]
    fn test_seed_reuses_company_and_traits() {
        let db = Database::open_in_memory().unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let first = seed(&db, &mut rng, 2, "Acme").unwrap();
        let second = seed(&db, &mut rng, 2, "acme").unwrap();
        assert_eq!(first.company_id, second.company_id);
        assert_eq!(db.list_traits().unwrap().len(), 10);
    }

    #[test]
    fn test_seed_needs_two_users() {
        let db = Database::open_in_memory().unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(seed(&db, &mut rng, 1, "Acme").is_err());
    }

    #[test]
    fn test_random_feedback_is_valid() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..50 {
            assert!(random_feedback(&mut rng).validate().is_ok());
        }
    }
}
