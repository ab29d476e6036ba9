use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use volmatch_core::{OpportunityId, Profile, TagSet};
use volmatch_ranking::{
    FeedState, FilterMode, FilterQuery, MatchEngine, QuizAnswers, RankingSource, RelevanceScorer,
};

#[derive(Debug, Parser)]
#[command(name = "volmatch")]
#[command(about = "Volunteer opportunity matching from the command line")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the JSON API.
    Serve,
    /// List opportunities for the stored profile, optionally filtered.
    Rank {
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        skill: Option<String>,
        #[arg(long)]
        interest: Option<String>,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
    },
    /// "Recommended for you", via the oracle when one is configured.
    Recommend,
    /// Known skills, interests and locations.
    Tags,
    Favorites,
    /// Toggle one favorite.
    Favorite { id: String },
    Profile {
        #[command(subcommand)]
        action: Option<ProfileAction>,
    },
    /// Turn free-text answers into profile tags.
    Quiz {
        #[arg(long, default_value = "")]
        interests: String,
        #[arg(long, default_value = "")]
        skills: String,
    },
}

#[derive(Debug, Subcommand)]
enum ProfileAction {
    Show,
    /// Comma-separated labels are added one by one.
    AddInterest { label: String },
    RemoveInterest { label: String },
    AddSkill { label: String },
    RemoveSkill { label: String },
    /// Drop all tags, keep the name.
    Clear,
    /// Back to the guest defaults.
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Rank {
        search: None,
        location: None,
        skill: None,
        interest: None,
        from: None,
        to: None,
    });

    let engine = MatchEngine::from_env()?;
    debug!(catalog = %engine.config.catalog_path.display(), "engine loaded");

    match command {
        Commands::Serve => volmatch_web::serve(engine, volmatch_web::port_from_env()).await?,
        Commands::Rank {
            search,
            location,
            skill,
            interest,
            from,
            to,
        } => {
            let filter = FilterQuery {
                search,
                location,
                skill,
                interest,
                start: from,
                end: to,
            }
            .into_filter();
            let profile = engine.profiles.load().await;
            let favorites = engine.favorites.load().await;
            let scorer = RelevanceScorer::new(&profile.tags);
            let ranked = engine.ranker.rank(&profile.tags, &filter);
            let mode = match FilterMode::select(&filter) {
                FilterMode::ManualFilter => "filters",
                FilterMode::ImplicitProfileMatch => "profile match",
            };
            println!("{} opportunities ({mode})", ranked.len());
            for opportunity in ranked {
                let star = if favorites.contains(opportunity.id) { "*" } else { " " };
                let date = opportunity
                    .start_date
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| "undated".into());
                println!(
                    "{star} {:>3}  {:<32} {:<26} {date}  {:?}",
                    opportunity.id.to_string(),
                    opportunity.title,
                    opportunity.location,
                    scorer.category(opportunity)
                );
            }
        }
        Commands::Recommend => {
            let profile = engine.profiles.load().await;
            engine.feed.refresh(&profile.tags).await;
            match engine.feed.state() {
                FeedState::Settled {
                    recommendations, ..
                } => {
                    match &recommendations.source {
                        RankingSource::Oracle => println!("ranked by recommendation service"),
                        RankingSource::Local => println!("ranked locally"),
                        RankingSource::LocalFallback { reason } => {
                            println!("ranked locally (service unavailable: {reason})")
                        }
                    }
                    for (idx, opportunity) in recommendations.opportunities.iter().enumerate() {
                        println!("{:>2}. {} - {}", idx + 1, opportunity.title, opportunity.organizer_label());
                    }
                }
                FeedState::Failed { reason, .. } => anyhow::bail!("recommendations failed: {reason}"),
                FeedState::Idle | FeedState::Loading { .. } => {
                    anyhow::bail!("recommendations did not settle")
                }
            }
        }
        Commands::Tags => {
            let tags = engine.ranker.tags();
            println!("skills: {}", tags.skills().join(", "));
            println!("interests: {}", tags.interests().join(", "));
            println!("locations: {}", tags.locations().join(", "));
        }
        Commands::Favorites => {
            let favorites = engine.favorites.load().await;
            println!("{} favorites", favorites.len());
            for id in favorites.ids() {
                match engine.ranker.find(*id) {
                    Some(o) => println!("{:>3}  {}", id.to_string(), o.title),
                    None => println!("{:>3}  (not in catalog)", id.to_string()),
                }
            }
        }
        Commands::Favorite { id } => {
            let id: OpportunityId = id.parse()?;
            let opportunity = engine
                .ranker
                .find(id)
                .with_context(|| format!("opportunity {id} not found"))?;
            let favorites = engine.favorites.toggle(id).await?;
            let verb = if favorites.contains(id) { "added" } else { "removed" };
            println!("{verb} favorite: {}", opportunity.title);
        }
        Commands::Profile { action } => {
            let profiles = &engine.profiles;
            let tags = engine.ranker.tags();
            let profile = match action.unwrap_or(ProfileAction::Show) {
                ProfileAction::Show => profiles.load().await,
                ProfileAction::AddInterest { label } => {
                    let mut profile = profiles.load().await;
                    for entry in TagSet::parse_list(&label).iter() {
                        let entry = tags.canonical_interest(entry).unwrap_or(entry);
                        profile = profiles.add_interest(entry).await?;
                    }
                    profile
                }
                ProfileAction::RemoveInterest { label } => profiles.remove_interest(&label).await?,
                ProfileAction::AddSkill { label } => {
                    let mut profile = profiles.load().await;
                    for entry in TagSet::parse_list(&label).iter() {
                        let entry = tags.canonical_skill(entry).unwrap_or(entry);
                        profile = profiles.add_skill(entry).await?;
                    }
                    profile
                }
                ProfileAction::RemoveSkill { label } => profiles.remove_skill(&label).await?,
                ProfileAction::Clear => profiles.clear_tags().await?,
                ProfileAction::Reset => profiles.reset().await?,
            };
            print_profile(&profile);
        }
        Commands::Quiz { interests, skills } => {
            let answers = QuizAnswers { interests, skills };
            let suggested = engine.tagger.suggest_tags(&answers).await?;
            let (profile, added) = engine.profiles.merge_tags(&suggested).await?;
            println!("{added} new tags from quiz");
            print_profile(&profile);
        }
    }

    Ok(())
}

fn print_profile(profile: &Profile) {
    println!("name: {}", profile.name);
    println!("interests: {}", profile.tags.interests.labels().join(", "));
    println!("skills: {}", profile.tags.skills.labels().join(", "));
}
