mod ai;
mod analytics;
mod auth;
mod config;
mod db;
mod error;
mod models;
mod seed;
mod web;

use ai::FeedbackGenerator;
use analytics::{FeedbackAnalytics, UserStats};
use anyhow::{anyhow, bail, Result};
use clap::Parser;
use config::{Cli, Commands};
use db::{Database, NewUser};
use tracing::{debug, info};

fn print_stats(name: &str, stats: &UserStats) {
    println!("Feedback for {}", name);
    println!("Received: {}", stats.received_feedback_count);
    println!("Overall average: {:.2}", stats.overall_avg_rating);

    println!("\nCompetencies:");
    for competency in &stats.competencies {
        println!("  {:<18} {:.2}", competency.name, competency.score);
    }

    if !stats.all_keywords.is_empty() {
        println!("\nKeywords: {}", stats.all_keywords.join(", "));
    }

    for (title, texts) in [("Strengths", &stats.strengths), ("To improve", &stats.improvements)] {
        if texts.is_empty() {
            continue;
        }
        println!("\n{}:", title);
        for text in texts {
            let wrapped = textwrap::fill(text, textwrap::Options::new(76).initial_indent("  - ").subsequent_indent("    "));
            println!("{}", wrapped);
        }
    }

    if !stats.recommended_trainings.is_empty() {
        println!("\nRecommended trainings:");
        for rec in &stats.recommended_trainings {
            println!("  {}: {}", rec.competency, rec.training);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    config::init_tracing(&cli.log_level);
    debug!("feedbackas v{} starting", env!("CARGO_PKG_VERSION"));

    let db = Database::open(cli.db.clone())?;

    match cli.command {
        Commands::Init => {
            db.init()?;
            println!("Database initialized at {}", db.path().display());
        }

        Commands::Serve(args) => {
            db.ensure_initialized()?;
            let generator = FeedbackGenerator::from_model(&args.model)?;
            if let Some(model) = generator.model_name() {
                info!(model, "AI feedback generation enabled");
            }
            let state = web::AppState::new(db, generator);
            web::serve(args.addr, state).await?;
        }

        Commands::Createsuperuser {
            username,
            email,
            password,
        } => {
            db.ensure_initialized()?;
            if db.username_taken(&username)? {
                bail!("Username '{}' is already taken", username);
            }
            let id = db.create_user(&NewUser {
                username: username.clone(),
                email,
                password_hash: auth::hash_password(&password)?,
                is_superuser: true,
                ..Default::default()
            })?;
            db.create_profile(id, None)?;
            println!("Superuser '{}' created (ID: {})", username, id);
        }

        Commands::Stats { username } => {
            db.ensure_initialized()?;
            let user = db
                .get_user_by_username(&username)?
                .ok_or_else(|| anyhow!("User '{}' not found", username))?;
            let stats = FeedbackAnalytics::user_stats(&db, user.id)?;
            print_stats(&user.display_name(), &stats);
        }

        Commands::Seed { users, company } => {
            db.ensure_initialized()?;
            let mut rng = rand::thread_rng();
            let summary = seed::seed(&db, &mut rng, users, &company)?;
            println!(
                "Seeded '{}': {} users, {} questionnaires, {} feedback entries",
                company, summary.users, summary.questionnaires, summary.feedback
            );
            println!("Every demo user's password is '{}'", seed::DEMO_PASSWORD);
        }
    }

    Ok(())
}
