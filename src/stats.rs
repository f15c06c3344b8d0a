use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    LowSubmissionUser, MonthlyAverage, MonthlyCount, OverallStats, ScoreDistribution,
    StatsReport, SubmissionRecord, TopPerformer, UserProfile, UNNAMED_USER,
};
use crate::month::YearMonth;

pub const SERIES_MONTHS: u32 = 12;
pub const WINDOW_MONTHS: u32 = 3;
pub const TOP_PERFORMER_LIMIT: usize = 5;
pub const LOW_SUBMISSION_THRESHOLD: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreBucket {
    Excellent,
    Good,
    Fair,
    NeedsImprovement,
}

impl ScoreBucket {
    pub fn of(score: f64) -> ScoreBucket {
        if score >= 90.0 {
            ScoreBucket::Excellent
        } else if score >= 80.0 {
            ScoreBucket::Good
        } else if score >= 70.0 {
            ScoreBucket::Fair
        } else {
            ScoreBucket::NeedsImprovement
        }
    }
}

impl ScoreDistribution {
    fn record(&mut self, bucket: ScoreBucket) {
        match bucket {
            ScoreBucket::Excellent => self.excellent += 1,
            ScoreBucket::Good => self.good += 1,
            ScoreBucket::Fair => self.fair += 1,
            ScoreBucket::NeedsImprovement => self.needs_improvement += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.excellent + self.good + self.fair + self.needs_improvement
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreTally {
    total: f64,
    count: usize,
}

impl ScoreTally {
    pub fn add(&mut self, score: f64) {
        self.total += score;
        self.count += 1;
    }

    pub fn average(&self) -> Option<f64> {
        (self.count > 0).then(|| round_one(self.total / self.count as f64))
    }
}

/// Rounds to one decimal on the exact binary value, as JavaScript's
/// `toFixed(1)` does: 82.05 is stored just below the half and goes down,
/// while exact halves such as 82.25 go away from zero.
pub fn round_one(value: f64) -> f64 {
    let quarters = value * 4.0;
    if quarters.fract() == 0.0 && quarters % 2.0 != 0.0 {
        return (value * 10.0).round() / 10.0;
    }
    format!("{value:.1}").parse().unwrap_or(value)
}

/// NaN and infinities count as "no score".
pub fn valid_score(score: Option<f64>) -> Option<f64> {
    score.filter(|value| value.is_finite())
}

/// Start of the three-month window: midnight UTC on the first day of the
/// month two months before `now`.
pub fn window_start(now: DateTime<Utc>) -> DateTime<Utc> {
    YearMonth::of(now).months_back(WINDOW_MONTHS - 1).start()
}

pub fn series_start(now: DateTime<Utc>) -> DateTime<Utc> {
    YearMonth::of(now).months_back(SERIES_MONTHS - 1).start()
}

pub fn in_window(created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    created_at >= window_start(now) && created_at <= now
}

/// Stored `year_month` when it is well formed, otherwise the UTC month of
/// `created_at`.
fn month_key(submission: &SubmissionRecord) -> String {
    submission
        .year_month
        .as_deref()
        .and_then(YearMonth::parse)
        .unwrap_or_else(|| YearMonth::of(submission.created_at))
        .to_string()
}

pub fn build_stats(
    submissions: &[SubmissionRecord],
    users: &[UserProfile],
    total_submissions: i64,
    now: DateTime<Utc>,
) -> StatsReport {
    let month_keys: Vec<String> = YearMonth::of(now)
        .trailing(SERIES_MONTHS)
        .iter()
        .map(ToString::to_string)
        .collect();

    let mut distribution = ScoreDistribution::default();
    let mut window_tally = ScoreTally::default();
    let mut user_tallies: BTreeMap<Uuid, ScoreTally> = BTreeMap::new();
    let mut window_counts: HashMap<Uuid, usize> = HashMap::new();

    for submission in submissions
        .iter()
        .filter(|submission| in_window(submission.created_at, now))
    {
        if let Some(score) = valid_score(submission.ai_score) {
            distribution.record(ScoreBucket::of(score));
            window_tally.add(score);
            user_tallies.entry(submission.user_id).or_default().add(score);
        }

        *window_counts.entry(submission.user_id).or_insert(0) += 1;
    }

    let mut monthly_counts: HashMap<String, usize> = HashMap::new();
    let mut monthly_tallies: HashMap<String, ScoreTally> = HashMap::new();

    for submission in submissions {
        let key = month_key(submission);
        *monthly_counts.entry(key.clone()).or_insert(0) += 1;

        if let Some(score) = valid_score(submission.ai_score) {
            monthly_tallies.entry(key).or_default().add(score);
        }
    }

    let monthly_submissions = month_keys
        .iter()
        .map(|key| MonthlyCount {
            year_month: key.clone(),
            count: monthly_counts.get(key).copied().unwrap_or(0),
        })
        .collect();

    let monthly_avg_scores = month_keys
        .iter()
        .map(|key| MonthlyAverage {
            year_month: key.clone(),
            avg_score: monthly_tallies.get(key).and_then(ScoreTally::average),
        })
        .collect();

    let profiles: HashMap<Uuid, &UserProfile> = users.iter().map(|user| (user.id, user)).collect();

    let mut top_performers: Vec<TopPerformer> = user_tallies
        .iter()
        .filter_map(|(id, tally)| {
            let avg_score = tally.average()?;
            let profile = profiles.get(id);
            Some(TopPerformer {
                id: *id,
                display_name: profile
                    .map(|user| user.label())
                    .unwrap_or_else(|| UNNAMED_USER.to_string()),
                department: profile.and_then(|user| user.department.clone()),
                avg_score,
            })
        })
        .collect();
    top_performers.sort_by(|a, b| b.avg_score.total_cmp(&a.avg_score));
    top_performers.truncate(TOP_PERFORMER_LIMIT);

    let mut low_submission_users: Vec<LowSubmissionUser> = users
        .iter()
        .map(|user| LowSubmissionUser {
            id: user.id,
            display_name: user.label(),
            department: user.department.clone(),
            submission_count_3months: window_counts.get(&user.id).copied().unwrap_or(0),
        })
        .filter(|user| user.submission_count_3months <= LOW_SUBMISSION_THRESHOLD)
        .collect();
    low_submission_users.sort_by_key(|user| user.submission_count_3months);

    StatsReport {
        overall: OverallStats {
            avg_score_3months: window_tally.average(),
            total_users: users.len(),
            total_submissions,
            active_users_3months: window_counts.len(),
        },
        monthly_submissions,
        score_distribution: distribution,
        monthly_avg_scores,
        top_performers,
        low_submission_users,
    }
}
