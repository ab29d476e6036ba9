use std::path::Path;

use volmatch_core::{Profile, ProfileTags, TagSet};
use volmatch_ranking::{
    load_catalog, local_recommendations, FilterQuery, FilterState, OpportunityRanker,
};

fn seed_ranker() -> OpportunityRanker {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../catalog.yaml");
    OpportunityRanker::new(load_catalog(&path).expect("seed catalog loads"))
}

fn ids(ranked: &[&volmatch_core::Opportunity]) -> Vec<u64> {
    ranked.iter().map(|o| o.id.0).collect()
}

#[test]
fn seed_catalog_loads_with_distinct_ids_and_tags() {
    let ranker = seed_ranker();
    assert_eq!(ranker.catalog().len(), 10);
    assert!(ranker.tags().locations().iter().any(|l| l == "City Center"));
    assert_eq!(ranker.tags().canonical_interest("education"), Some("Education"));
}

#[test]
fn default_profile_surfaces_environmental_roles() {
    let ranker = seed_ranker();
    let profile = Profile::default();
    let ranked = ranker.rank(&profile.tags, &FilterState::default());
    assert_eq!(ids(&ranked), vec![1, 7]);
}

#[test]
fn manual_filters_on_the_seed_catalog() {
    let ranker = seed_ranker();
    let profile = Profile::default();

    let garden = FilterQuery {
        search: Some("garden".into()),
        ..Default::default()
    }
    .into_filter();
    assert!(ids(&ranker.rank(&profile.tags, &garden)).contains(&1));

    let impossible = FilterQuery {
        location: Some("City Center".into()),
        skill: Some("Mentoring".into()),
        ..Default::default()
    }
    .into_filter();
    assert!(ranker.rank(&profile.tags, &impossible).is_empty());

    let november = FilterQuery {
        start: Some("2025-11-01".into()),
        end: Some("2025-11-30".into()),
        ..Default::default()
    }
    .into_filter();
    assert_eq!(ids(&ranker.rank(&profile.tags, &november)), vec![1, 7, 2, 4]);
}

#[tokio::test]
async fn recommendations_without_an_oracle_use_local_ranking() {
    let ranker = seed_ranker();
    let tags = ProfileTags {
        interests: ["Education"].into_iter().collect::<TagSet>(),
        skills: TagSet::new(),
    };
    let got = ranker.recommend(&tags).await.expect("local ranking never fails");
    let top = got.opportunities.iter().take(2).map(|o| o.id.0).collect::<Vec<_>>();
    assert_eq!(top, vec![2, 10]);
    assert_eq!(
        got.opportunities,
        local_recommendations(tags.interests.labels(), ranker.catalog())
    );
}
