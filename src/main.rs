use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use roommate_match::config::RuntimeArgs;
use roommate_match::error::TeamError;
use roommate_match::matching::{recommend_teammates, MatchDriver, MatchEngine, ScanOutcome};
use roommate_match::models::{Gender, StudentId, TeamId};
use roommate_match::report::{self, OpenStudent};
use roommate_match::scoring::SimilarityScorer;
use roommate_match::store::{postgres, MatchStore, PgStore, SettingsStore, TeamStore};
use roommate_match::team::{JoinOutcome, LeaveOutcome, ProcessOutcome, TeamStateMachine};

#[derive(Parser)]
#[command(name = "roommate-match")]
#[command(about = "Roommate questionnaire matching and team formation", long_about = None)]
struct Cli {
    #[command(flatten)]
    runtime: RuntimeArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Decision {
    Accept,
    Reject,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a small questionnaire, students and an open matching window
    Seed,
    /// Import questionnaire answers from a CSV file
    ImportAnswers {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Run one matching scan
    Scan,
    /// Keep scanning on an interval until interrupted
    Watch,
    /// Create an empty team
    CreateTeam {
        #[arg(long)]
        gender: Gender,
        #[arg(long)]
        description: Option<String>,
    },
    /// Delete a team, releasing its members
    DeleteTeam {
        #[arg(long)]
        team: TeamId,
    },
    /// Put a student into a team
    Join {
        #[arg(long)]
        student: StudentId,
        #[arg(long)]
        team: TeamId,
    },
    /// Take a student out of their team
    Leave {
        #[arg(long)]
        student: StudentId,
    },
    /// Invite a student into the inviter's team, or into a new one
    Invite {
        #[arg(long)]
        from: StudentId,
        #[arg(long)]
        to: StudentId,
    },
    /// Ask to join a team
    Request {
        #[arg(long)]
        student: StudentId,
        #[arg(long)]
        team: TeamId,
    },
    /// Accept, reject or withdraw an invitation
    ProcessInvitation {
        #[arg(long)]
        actor: StudentId,
        #[arg(long)]
        id: i64,
        #[arg(long, value_enum)]
        decision: Decision,
    },
    /// Accept, reject or withdraw a team request
    ProcessRequest {
        #[arg(long)]
        actor: StudentId,
        #[arg(long)]
        id: i64,
        #[arg(long, value_enum)]
        decision: Decision,
    },
    /// List likely teammates for a student
    Recommend {
        #[arg(long)]
        student: StudentId,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Generate a markdown report
    Report {
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
        #[arg(long, default_value_t = 3)]
        top: usize,
    },
}

fn rejected(err: TeamError) -> anyhow::Error {
    let kind = err.kind();
    anyhow::Error::new(err).context(format!("operation rejected ({kind:?})"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.runtime.log_filter())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cli.runtime.database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = Arc::new(PgStore::new(pool));
    let teams = TeamStateMachine::new(Arc::clone(&store), cli.runtime.team_policy());

    match cli.command {
        Commands::InitDb => {
            postgres::init_db(store.pool()).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            postgres::seed(&store).await?;
            println!("Seed data inserted.");
        }
        Commands::ImportAnswers { csv } => {
            let summary = postgres::import_csv(store.as_ref(), &csv).await?;
            println!(
                "Saved {} answers for {} students from {} ({} scores invalidated).",
                summary.saved,
                summary.students,
                csv.display(),
                summary.scores_invalidated
            );
        }
        Commands::Scan => {
            let engine = MatchEngine::new(
                Arc::clone(&store),
                cli.runtime.encoder()?,
                SimilarityScorer::default(),
            );
            match engine.run_once(chrono::Local::now().naive_local()).await? {
                ScanOutcome::OutsideWindow => println!("Outside the matching window; nothing to do."),
                ScanOutcome::Completed(summary) => println!(
                    "Scan {} computed {} scores for {} students ({} skipped, {} embeddings).",
                    summary.run_id, summary.computed, summary.students, summary.skipped, summary.embedded
                ),
            }
        }
        Commands::Watch => {
            let engine = MatchEngine::new(
                Arc::clone(&store),
                cli.runtime.encoder()?,
                SimilarityScorer::default(),
            );
            let driver = MatchDriver::new(Arc::new(engine));
            driver
                .run(cli.runtime.scan_interval(), async {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("interrupt received");
                    }
                })
                .await;
        }
        Commands::CreateTeam {
            gender,
            description,
        } => {
            let team = teams
                .create_team(gender, description.as_deref())
                .await
                .map_err(rejected)?;
            println!("Created team {team}.");
        }
        Commands::DeleteTeam { team } => {
            let released = teams.delete_team(team).await.map_err(rejected)?;
            println!("Deleted team {team}; released {released} members.");
        }
        Commands::Join { student, team } => match teams.join(student, team).await.map_err(rejected)? {
            JoinOutcome::Joined { team, invalidated } => {
                println!("Student {student} joined team {team}; {invalidated} pending records closed.")
            }
            JoinOutcome::AlreadyMember { team } => {
                println!("Student {student} is already in team {team}.")
            }
        },
        Commands::Leave { student } => match teams.leave(student).await.map_err(rejected)? {
            LeaveOutcome::NotInTeam => println!("Student {student} is not in a team."),
            LeaveOutcome::Left { team } => println!("Student {student} left team {team}."),
            LeaveOutcome::Dissolved { team, released } => {
                println!("Team {team} dissolved; released {released} members.")
            }
        },
        Commands::Invite { from, to } => {
            let id = teams.invite(from, to).await.map_err(rejected)?;
            println!("Invitation {id} sent.");
        }
        Commands::Request { student, team } => {
            let id = teams.request(student, team).await.map_err(rejected)?;
            println!("Request {id} submitted.");
        }
        Commands::ProcessInvitation {
            actor,
            id,
            decision,
        } => {
            let accept = matches!(decision, Decision::Accept);
            let outcome = teams
                .process_invitation(actor, id, accept)
                .await
                .map_err(rejected)?;
            print_process_outcome("Invitation", id, outcome);
        }
        Commands::ProcessRequest {
            actor,
            id,
            decision,
        } => {
            let accept = matches!(decision, Decision::Accept);
            let outcome = teams
                .process_request(actor, id, accept)
                .await
                .map_err(rejected)?;
            print_process_outcome("Request", id, outcome);
        }
        Commands::Recommend {
            student,
            limit,
            json,
        } => {
            let recs = recommend_teammates(store.as_ref(), student).await?;
            if json {
                let listed: Vec<_> = recs.scored.iter().chain(recs.unscored.iter()).take(limit).collect();
                println!("{}", serde_json::to_string_pretty(&listed)?);
                return Ok(());
            }
            if recs.scored.is_empty() && recs.unscored.is_empty() {
                println!("No candidates for student {student}.");
                return Ok(());
            }
            println!("Top matches for student {student}:");
            for rec in recs.scored.iter().take(limit) {
                println!(
                    "- {} ({}) score {:.2} {}",
                    rec.name,
                    rec.student_id,
                    rec.score.unwrap_or_default(),
                    rec.contact.as_deref().unwrap_or("")
                );
            }
            if !recs.unscored.is_empty() {
                println!("{} more candidates have no score yet.", recs.unscored.len());
            }
        }
        Commands::Report { out, top } => {
            let capacity = store.settings().await?.team_capacity;
            let rosters = store.rosters().await?;
            let mut open = Vec::new();
            for gender in [Gender::Male, Gender::Female, Gender::Unknown] {
                for student in store.students_by_gender(gender).await? {
                    if student.team_id.is_some() {
                        continue;
                    }
                    let recommendations = recommend_teammates(store.as_ref(), student.id).await?;
                    open.push(OpenStudent {
                        student,
                        recommendations,
                    });
                }
            }
            let report = report::build_report(
                chrono::Local::now().naive_local(),
                capacity,
                &rosters,
                &open,
                top,
            );
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}

fn print_process_outcome(label: &str, id: i64, outcome: ProcessOutcome) {
    match outcome {
        ProcessOutcome::Withdrawn => println!("{label} {id} withdrawn."),
        ProcessOutcome::Rejected => println!("{label} {id} rejected."),
        ProcessOutcome::Joined {
            team,
            created_team: true,
        } => println!("{label} {id} accepted; new team {team} formed."),
        ProcessOutcome::Joined { team, .. } => println!("{label} {id} accepted; joined team {team}."),
    }
}
