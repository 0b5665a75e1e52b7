//! Core movie data model and derived-column math for cinemeta.

use serde::{Deserialize, Serialize, Serializer};

pub const CRATE_NAME: &str = "cinemeta-core";

/// Join key shared by every table the pipelines read or write.
pub const ID_COLUMN: &str = "id";
pub const BUDGET_COLUMN: &str = "budget";
pub const REVENUE_COLUMN: &str = "revenue";
pub const DIRECTOR_COLUMN: &str = "director";
pub const AVG_CAST_POPULARITY_COLUMN: &str = "avg_cast_popularity";
pub const BUDGET_LOG_COLUMN: &str = "budget_log";
pub const REVENUE_LOG_COLUMN: &str = "revenue_log";
pub const PROFIT_RATIO_COLUMN: &str = "profit_ratio";

/// Crew job that marks the primary contributor.
pub const DIRECTOR_JOB: &str = "Director";

/// How many leading cast credits feed `avg_cast_popularity`.
pub const TOP_CAST_COUNT: usize = 3;

/// One page of the discover endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DiscoverPage {
    #[serde(default)]
    pub page: u32,
    #[serde(default = "default_total_pages")]
    pub total_pages: u32,
    #[serde(default)]
    pub total_results: u64,
    #[serde(default)]
    pub results: Vec<DiscoveredMovie>,
}

fn default_total_pages() -> u32 {
    1
}

/// Raw movie record as returned by the discover endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DiscoveredMovie {
    pub adult: Option<bool>,
    pub backdrop_path: Option<String>,
    pub genre_ids: Vec<i64>,
    pub id: i64,
    pub original_language: Option<String>,
    pub original_title: Option<String>,
    pub overview: Option<String>,
    pub popularity: Option<f64>,
    pub poster_path: Option<String>,
    pub release_date: Option<String>,
    pub title: Option<String>,
    pub video: Option<bool>,
    pub vote_average: Option<f64>,
    pub vote_count: Option<u64>,
}

/// Header of the discovery output, in [`DiscoveredMovieRow`] field order.
pub const DISCOVERED_MOVIE_COLUMNS: [&str; 14] = [
    "adult",
    "backdrop_path",
    "genre_ids",
    "id",
    "original_language",
    "original_title",
    "overview",
    "popularity",
    "poster_path",
    "release_date",
    "title",
    "video",
    "vote_average",
    "vote_count",
];

/// Flat CSV row for a discovered movie; column order follows the API payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveredMovieRow {
    #[serde(serialize_with = "title_case_bool")]
    pub adult: Option<bool>,
    pub backdrop_path: Option<String>,
    pub genre_ids: String,
    pub id: i64,
    pub original_language: Option<String>,
    pub original_title: Option<String>,
    pub overview: Option<String>,
    pub popularity: Option<f64>,
    pub poster_path: Option<String>,
    pub release_date: Option<String>,
    pub title: Option<String>,
    #[serde(serialize_with = "title_case_bool")]
    pub video: Option<bool>,
    pub vote_average: Option<f64>,
    pub vote_count: Option<u64>,
}

/// Existing discovery files spell booleans `True` / `False`.
fn title_case_bool<S: Serializer>(value: &Option<bool>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(true) => serializer.serialize_str("True"),
        Some(false) => serializer.serialize_str("False"),
        None => serializer.serialize_none(),
    }
}

impl From<&DiscoveredMovie> for DiscoveredMovieRow {
    fn from(movie: &DiscoveredMovie) -> Self {
        let genre_ids = format!(
            "[{}]",
            movie
                .genre_ids
                .iter()
                .map(|g| g.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Self {
            adult: movie.adult,
            backdrop_path: movie.backdrop_path.clone(),
            genre_ids,
            id: movie.id,
            original_language: movie.original_language.clone(),
            original_title: movie.original_title.clone(),
            overview: movie.overview.clone(),
            popularity: movie.popularity,
            poster_path: movie.poster_path.clone(),
            release_date: movie.release_date.clone(),
            title: movie.title.clone(),
            video: movie.video,
            vote_average: movie.vote_average,
            vote_count: movie.vote_count,
        }
    }
}

/// Subset of the movie detail payload the enrichment pass reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MovieDetails {
    pub id: i64,
    #[serde(default)]
    pub budget: Option<f64>,
    #[serde(default)]
    pub revenue: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CastCredit {
    pub name: Option<String>,
    pub character: Option<String>,
    pub popularity: Option<f64>,
    pub order: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CrewCredit {
    pub name: Option<String>,
    pub job: Option<String>,
    pub department: Option<String>,
}

/// Credits payload for one movie. Cast order is the order TMDB bills it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MovieCredits {
    pub id: Option<i64>,
    pub cast: Vec<CastCredit>,
    pub crew: Vec<CrewCredit>,
}

impl MovieCredits {
    /// Name on the first crew credit tagged as director.
    pub fn director(&self) -> Option<String> {
        self.crew
            .iter()
            .find(|c| c.job.as_deref() == Some(DIRECTOR_JOB))
            .and_then(|c| c.name.clone())
    }

    /// Mean popularity over the first [`TOP_CAST_COUNT`] cast credits.
    ///
    /// Credits without a popularity value are skipped rather than counted as zero,
    /// so the mean is over the credits that report one; `None` when nothing is left.
    pub fn top_cast_popularity(&self) -> Option<f64> {
        let values = self
            .cast
            .iter()
            .take(TOP_CAST_COUNT)
            .filter_map(|c| c.popularity)
            .filter(|p| p.is_finite())
            .collect::<Vec<_>>();
        if values.is_empty() {
            return None;
        }
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Narrow per-movie supplement produced by the enrichment pass and stored in the checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    pub id: i64,
    pub budget: Option<f64>,
    pub revenue: Option<f64>,
    pub director: Option<String>,
    pub avg_cast_popularity: Option<f64>,
}

impl EnrichmentRecord {
    /// Both payloads are required; there is no constructor for a partial record.
    pub fn from_payloads(id: i64, details: &MovieDetails, credits: &MovieCredits) -> Self {
        Self {
            id,
            budget: details.budget,
            revenue: details.revenue,
            director: credits.director(),
            avg_cast_popularity: credits.top_cast_popularity(),
        }
    }
}

/// `ln(1 + value)` for positive values, absent otherwise.
pub fn log1p_positive(value: Option<f64>) -> Option<f64> {
    match value {
        Some(v) if v.is_finite() && v > 0.0 => Some(v.ln_1p()),
        _ => None,
    }
}

/// `revenue / budget` when both are present and the budget is positive.
pub fn profit_ratio(budget: Option<f64>, revenue: Option<f64>) -> Option<f64> {
    match (budget, revenue) {
        (Some(b), Some(r)) if b.is_finite() && r.is_finite() && b > 0.0 => Some(r / b),
        _ => None,
    }
}
