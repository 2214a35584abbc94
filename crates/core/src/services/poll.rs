//! Poll service.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::{DateTime, Duration, Utc};
use pollivu_common::config::PollsConfig;
use pollivu_common::text::char_len;
use pollivu_common::{
    AppError, AppResult, CryptoVault, EncryptedField, IdGenerator, OptionCount,
    ResultAggregator, SessionId, VoterToken, get_metrics, hash_token, is_valid_poll_id,
    sanitize_text,
};
use pollivu_db::entities::{poll, poll_option};
use pollivu_db::{PollStore, PollWithOptions, SettingsUpdate};
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;

use super::notifier::ChangeNotifier;

/// Upper bound for the public poll list.
const MAX_LIST_LIMIT: u64 = 100;

/// Expiration presets offered to creators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    OneHour,
    SixHours,
    OneDay,
    SevenDays,
    ThirtyDays,
    Never,
}

impl Expiration {
    /// Expiry time for a poll created or edited at `now`.
    #[must_use]
    pub fn expires_at(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let lifetime = match self {
            Self::OneHour => Duration::hours(1),
            Self::SixHours => Duration::hours(6),
            Self::OneDay => Duration::hours(24),
            Self::SevenDays => Duration::days(7),
            Self::ThirtyDays => Duration::days(30),
            Self::Never => return None,
        };
        Some(now + lifetime)
    }
}

impl FromStr for Expiration {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1h" => Ok(Self::OneHour),
            "6h" => Ok(Self::SixHours),
            "24h" => Ok(Self::OneDay),
            "7d" => Ok(Self::SevenDays),
            "30d" => Ok(Self::ThirtyDays),
            "never" => Ok(Self::Never),
            other => Err(AppError::Validation(format!(
                "Unknown expiration '{other}'"
            ))),
        }
    }
}

/// Input for creating a poll.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreatePollInput {
    #[validate(length(min = 1))]
    pub question: String,
    #[validate(length(min = 1))]
    pub options: Vec<String>,
    /// One of `1h`, `6h`, `24h`, `7d`, `30d`, `never`.
    #[serde(default)]
    pub expiration: Option<String>,
    #[serde(default)]
    pub allow_vote_change: bool,
    #[serde(default)]
    pub show_results_before_voting: bool,
    #[serde(default = "default_true")]
    pub is_public: bool,
    #[serde(default = "default_true")]
    pub share_results_chart: bool,
    #[serde(default = "default_true")]
    pub share_results_list: bool,
    #[serde(default = "default_true")]
    pub share_insights: bool,
    /// Store question and option texts encrypted at rest.
    #[serde(default)]
    pub encrypt: bool,
}

const fn default_true() -> bool {
    true
}

/// Input for editing poll settings. Absent fields are left unchanged.
#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EditPollInput {
    #[validate(length(min = 1))]
    pub question: Option<String>,
    pub allow_vote_change: Option<bool>,
    pub show_results_before_voting: Option<bool>,
    pub is_public: Option<bool>,
    pub share_results_chart: Option<bool>,
    pub share_results_list: Option<bool>,
    pub share_insights: Option<bool>,
    /// `current` keeps the expiry, `never` clears it, a preset restarts it.
    pub expiration: Option<String>,
}

/// An option as shown to viewers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionView {
    pub id: String,
    pub text: String,
    pub display_order: i32,
    pub votes: i64,
    pub percentage: f64,
}

/// A poll as shown to viewers, with texts decrypted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollView {
    pub id: String,
    pub question: String,
    pub is_encrypted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_closed: bool,
    pub is_public: bool,
    pub is_active: bool,
    pub is_expired: bool,
    pub allow_vote_change: bool,
    pub show_results_before_voting: bool,
    pub share_results_chart: bool,
    pub share_results_list: bool,
    pub share_insights: bool,
    pub total_votes: i64,
    pub version: i64,
    /// Counts were withheld because the viewer has not voted yet.
    pub results_hidden: bool,
    pub options: Vec<OptionView>,
}

impl PollView {
    /// Withhold counts from a viewer who may not see them yet.
    #[must_use]
    pub fn hide_results(mut self) -> Self {
        self.total_votes = 0;
        for option in &mut self.options {
            option.votes = 0;
            option.percentage = 0.0;
        }
        self.results_hidden = true;
        self
    }
}

/// A freshly created poll and its one-time creator token.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedPoll {
    pub poll: PollView,
    /// Shown to the creator once; only its hash is stored.
    pub creator_token: String,
}

/// Whether a session has voted on a poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoterStatus {
    pub has_voted: bool,
    pub voted_option_id: Option<String>,
}

/// Votes recorded during one hour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelinePoint {
    pub hour: DateTime<Utc>,
    pub count: i64,
}

/// An option text weighted by its votes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionWeight {
    pub text: String,
    pub weight: i64,
}

/// Vote activity for a poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollAnalytics {
    /// Hourly vote counts, oldest first.
    pub timeline: Vec<TimelinePoint>,
    /// Options that received votes.
    pub option_weights: Vec<OptionWeight>,
}

/// Poll service for poll management.
#[derive(Clone)]
pub struct PollService {
    store: Arc<dyn PollStore>,
    notifier: ChangeNotifier,
    vault: Arc<CryptoVault>,
    limits: PollsConfig,
    id_gen: IdGenerator,
}

impl PollService {
    /// Create a new poll service.
    #[must_use]
    pub fn new(
        store: Arc<dyn PollStore>,
        notifier: ChangeNotifier,
        vault: Arc<CryptoVault>,
        limits: PollsConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            vault,
            limits,
            id_gen: IdGenerator::new(),
        }
    }

    /// Create a poll with its options.
    pub async fn create(&self, input: CreatePollInput) -> AppResult<CreatedPoll> {
        input.validate()?;

        let question = self.clean_question(&input.question)?;
        let texts = self.clean_options(&input.options)?;
        let expiration = input
            .expiration
            .as_deref()
            .map_or(Ok(Expiration::Never), Expiration::from_str)?;

        let now = Utc::now();
        let poll_id = self.id_gen.generate_poll_id();
        let creator_token = self.id_gen.generate_creator_token();
        let encrypt = input.encrypt;

        let options = texts
            .iter()
            .enumerate()
            .map(|(i, text)| {
                Ok(poll_option::Model {
                    id: self.id_gen.generate(),
                    poll_id: poll_id.clone(),
                    text: self.seal(encrypt, text)?,
                    display_order: i as i32,
                    vote_count: 0,
                })
            })
            .collect::<AppResult<Vec<_>>>()?;

        let poll = poll::Model {
            id: poll_id.clone(),
            question: self.seal(encrypt, &question)?,
            is_encrypted: encrypt,
            created_at: now,
            updated_at: now,
            expires_at: expiration.expires_at(now),
            is_closed: false,
            is_public: input.is_public,
            allow_vote_change: input.allow_vote_change,
            show_results_before_voting: input.show_results_before_voting,
            share_results_chart: input.share_results_chart,
            share_results_list: input.share_results_list,
            share_insights: input.share_insights,
            creator_token_hash: hash_token(&creator_token),
            total_votes: 0,
            version: 1,
        };

        let created = self.store.create_poll(PollWithOptions { poll, options }).await?;
        get_metrics().polls_created.fetch_add(1, Ordering::Relaxed);
        info!(
            poll_id = %poll_id,
            options = texts.len(),
            encrypted = encrypt,
            "Poll created"
        );

        Ok(CreatedPoll {
            poll: self.render(&created, now)?,
            creator_token,
        })
    }

    /// Get a poll for display.
    pub async fn get(&self, poll_id: &str) -> AppResult<PollView> {
        let view = self.load(poll_id).await?;
        self.render(&view, Utc::now())
    }

    /// Edit poll settings.
    pub async fn edit(
        &self,
        poll_id: &str,
        creator_token: &str,
        input: EditPollInput,
    ) -> AppResult<PollView> {
        input.validate()?;
        let current = self.authorize(poll_id, creator_token).await?;
        let now = Utc::now();

        let question = match &input.question {
            Some(q) => {
                let cleaned = self.clean_question(q)?;
                Some(self.seal(current.poll.is_encrypted, &cleaned)?)
            }
            None => None,
        };
        let expires_at = match input.expiration.as_deref() {
            None | Some("current") => None,
            Some(preset) => Some(Expiration::from_str(preset)?.expires_at(now)),
        };

        let update = SettingsUpdate {
            question,
            allow_vote_change: input.allow_vote_change,
            show_results_before_voting: input.show_results_before_voting,
            is_public: input.is_public,
            share_results_chart: input.share_results_chart,
            share_results_list: input.share_results_list,
            share_insights: input.share_insights,
            expires_at,
            ..Default::default()
        };

        self.apply(poll_id, &update, now, "Poll edited").await
    }

    /// Stop accepting votes.
    pub async fn close(&self, poll_id: &str, creator_token: &str) -> AppResult<PollView> {
        self.authorize(poll_id, creator_token).await?;
        let update = SettingsUpdate {
            is_closed: Some(true),
            ..Default::default()
        };
        self.apply(poll_id, &update, Utc::now(), "Poll closed").await
    }

    /// Accept votes again. An expired poll loses its expiry so it becomes
    /// active.
    pub async fn reopen(&self, poll_id: &str, creator_token: &str) -> AppResult<PollView> {
        let current = self.authorize(poll_id, creator_token).await?;
        let now = Utc::now();
        let update = SettingsUpdate {
            is_closed: Some(false),
            expires_at: current.poll.is_expired_at(now).then_some(None),
            ..Default::default()
        };
        self.apply(poll_id, &update, now, "Poll reopened").await
    }

    /// Flip the public listing flag.
    pub async fn toggle_public(&self, poll_id: &str, creator_token: &str) -> AppResult<PollView> {
        let current = self.authorize(poll_id, creator_token).await?;
        let update = SettingsUpdate {
            is_public: Some(!current.poll.is_public),
            ..Default::default()
        };
        self.apply(poll_id, &update, Utc::now(), "Poll visibility toggled")
            .await
    }

    /// Append an option to a poll.
    pub async fn add_option(
        &self,
        poll_id: &str,
        creator_token: &str,
        text: &str,
    ) -> AppResult<OptionView> {
        let current = self.authorize(poll_id, creator_token).await?;
        let text = self.clean_option(text)?;

        let existing = current
            .options
            .iter()
            .map(|o| self.reveal(current.poll.is_encrypted, &o.text))
            .collect::<AppResult<Vec<_>>>()?;
        if existing.iter().any(|e| e.to_lowercase() == text.to_lowercase()) {
            return Err(AppError::Validation("Option already exists".to_string()));
        }

        let option = poll_option::Model {
            id: self.id_gen.generate(),
            poll_id: poll_id.to_string(),
            text: self.seal(current.poll.is_encrypted, &text)?,
            display_order: 0,
            vote_count: 0,
        };
        let added = self
            .store
            .add_option(poll_id, option, self.limits.max_options, Utc::now())
            .await?;
        self.notifier.invalidate(poll_id).await;
        info!(poll_id = %poll_id, option_id = %added.id, "Option added");

        Ok(OptionView {
            id: added.id,
            text,
            display_order: added.display_order,
            votes: 0,
            percentage: 0.0,
        })
    }

    /// Remove an option together with the votes it holds.
    pub async fn remove_option(
        &self,
        poll_id: &str,
        creator_token: &str,
        option_id: &str,
    ) -> AppResult<()> {
        self.authorize(poll_id, creator_token).await?;
        self.store
            .remove_option(poll_id, option_id, self.limits.min_options, Utc::now())
            .await?;
        self.notifier.invalidate(poll_id).await;
        info!(poll_id = %poll_id, option_id = %option_id, "Option removed");
        Ok(())
    }

    /// Delete a poll, its options and its ledger.
    pub async fn delete(&self, poll_id: &str, creator_token: &str) -> AppResult<()> {
        self.authorize(poll_id, creator_token).await?;
        if !self.store.delete_poll(poll_id).await? {
            return Err(AppError::PollNotFound(poll_id.to_string()));
        }
        self.notifier.invalidate(poll_id).await;
        get_metrics().polls_deleted.fetch_add(1, Ordering::Relaxed);
        info!(poll_id = %poll_id, "Poll deleted");
        Ok(())
    }

    /// Newest public polls.
    pub async fn list_public(&self, limit: u64) -> AppResult<Vec<PollView>> {
        let now = Utc::now();
        self.store
            .list_public(limit.clamp(1, MAX_LIST_LIMIT))
            .await?
            .iter()
            .map(|view| self.render(view, now))
            .collect()
    }

    /// Whether `session` has voted on `poll_id`, and for what.
    pub async fn voter_status(&self, poll_id: &str, session: &SessionId) -> AppResult<VoterStatus> {
        if !is_valid_poll_id(poll_id) {
            return Err(AppError::PollNotFound(poll_id.to_string()));
        }
        let token = VoterToken::derive(session, poll_id);
        let record = self.store.find_vote(poll_id, token.as_str()).await?;
        Ok(VoterStatus {
            has_voted: record.is_some(),
            voted_option_id: record.map(|r| r.option_id),
        })
    }

    /// Results as CSV.
    pub async fn export_csv(&self, poll_id: &str) -> AppResult<String> {
        let view = self.get(poll_id).await?;

        let mut out = String::from("Pollivu Export\n");
        out.push_str(&format!("Question,{}\n", csv_field(&view.question)));
        out.push_str(&format!("Total Votes,{}\n", view.total_votes));
        out.push('\n');
        out.push_str("Option,Votes,Percentage\n");
        for option in &view.options {
            out.push_str(&format!(
                "{},{},{:.1}%\n",
                csv_field(&option.text),
                option.votes,
                option.percentage
            ));
        }
        Ok(out)
    }

    /// Hourly activity and option weights.
    ///
    /// Public when the creator shares insights, otherwise creator-only.
    pub async fn analytics(
        &self,
        poll_id: &str,
        creator_token: Option<&str>,
    ) -> AppResult<PollAnalytics> {
        let view = self.load(poll_id).await?;
        let is_creator = creator_token.is_some_and(|token| holds_creator_token(&view, token));
        if !view.poll.share_insights && !is_creator {
            return Err(AppError::Forbidden(
                "Insights for this poll are not shared".to_string(),
            ));
        }

        let timeline = if view.poll.total_votes > 0 {
            self.store
                .vote_timeline(poll_id)
                .await?
                .into_iter()
                .map(|h| TimelinePoint {
                    hour: h.hour,
                    count: h.count,
                })
                .collect()
        } else {
            Vec::new()
        };

        let option_weights = self
            .render(&view, Utc::now())?
            .options
            .into_iter()
            .filter(|o| o.votes > 0)
            .map(|o| OptionWeight {
                text: o.text,
                weight: o.votes,
            })
            .collect();

        Ok(PollAnalytics {
            timeline,
            option_weights,
        })
    }

    /// Delete every poll past its expiry and drop their cached snapshots.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let deleted = self.store.delete_expired(now).await?;
        for poll_id in &deleted {
            self.notifier.invalidate(poll_id).await;
        }
        let count = deleted.len() as u64;
        if count > 0 {
            get_metrics()
                .polls_deleted
                .fetch_add(count, Ordering::Relaxed);
        }
        Ok(count)
    }

    async fn load(&self, poll_id: &str) -> AppResult<PollWithOptions> {
        if !is_valid_poll_id(poll_id) {
            return Err(AppError::PollNotFound(poll_id.to_string()));
        }
        self.store
            .find_poll(poll_id)
            .await?
            .ok_or_else(|| AppError::PollNotFound(poll_id.to_string()))
    }

    async fn authorize(&self, poll_id: &str, creator_token: &str) -> AppResult<PollWithOptions> {
        let view = self.load(poll_id).await?;
        if !holds_creator_token(&view, creator_token) {
            return Err(AppError::Forbidden(
                "Creator token does not match this poll".to_string(),
            ));
        }
        Ok(view)
    }

    async fn apply(
        &self,
        poll_id: &str,
        update: &SettingsUpdate,
        now: DateTime<Utc>,
        what: &'static str,
    ) -> AppResult<PollView> {
        self.store
            .update_settings(poll_id, update, now)
            .await?
            .ok_or_else(|| AppError::PollNotFound(poll_id.to_string()))?;
        self.notifier.invalidate(poll_id).await;
        info!(poll_id = %poll_id, "{what}");
        self.get(poll_id).await
    }

    fn render(&self, view: &PollWithOptions, now: DateTime<Utc>) -> AppResult<PollView> {
        let poll = &view.poll;
        let counts: Vec<OptionCount> = view
            .options
            .iter()
            .map(|o| OptionCount {
                option_id: o.id.clone(),
                votes: o.vote_count,
            })
            .collect();
        let tally = ResultAggregator::aggregate(&counts);

        let options = view
            .options
            .iter()
            .zip(&tally.results)
            .map(|(option, result)| {
                Ok(OptionView {
                    id: option.id.clone(),
                    text: self.reveal(poll.is_encrypted, &option.text)?,
                    display_order: option.display_order,
                    votes: result.votes,
                    percentage: result.percentage,
                })
            })
            .collect::<AppResult<Vec<_>>>()?;

        Ok(PollView {
            id: poll.id.clone(),
            question: self.reveal(poll.is_encrypted, &poll.question)?,
            is_encrypted: poll.is_encrypted,
            created_at: poll.created_at,
            updated_at: poll.updated_at,
            expires_at: poll.expires_at,
            is_closed: poll.is_closed,
            is_public: poll.is_public,
            is_active: poll.is_active_at(now),
            is_expired: poll.is_expired_at(now),
            allow_vote_change: poll.allow_vote_change,
            show_results_before_voting: poll.show_results_before_voting,
            share_results_chart: poll.share_results_chart,
            share_results_list: poll.share_results_list,
            share_insights: poll.share_insights,
            total_votes: tally.total_votes,
            version: poll.version,
            results_hidden: false,
            options,
        })
    }

    fn seal(&self, encrypt: bool, text: &str) -> AppResult<String> {
        if encrypt {
            Ok(self.vault.encrypt_str(text)?.encode())
        } else {
            Ok(text.to_string())
        }
    }

    fn reveal(&self, encrypted: bool, stored: &str) -> AppResult<String> {
        if encrypted {
            self.vault.decrypt_str(&EncryptedField::decode(stored)?)
        } else {
            Ok(stored.to_string())
        }
    }

    fn clean_question(&self, raw: &str) -> AppResult<String> {
        let question = sanitize_text(raw);
        if question.is_empty() {
            return Err(AppError::Validation("Question cannot be empty".to_string()));
        }
        if char_len(&question) > self.limits.max_question_length {
            return Err(AppError::Validation(format!(
                "Question is too long (max {} characters)",
                self.limits.max_question_length
            )));
        }
        Ok(question)
    }

    fn clean_option(&self, raw: &str) -> AppResult<String> {
        let text = sanitize_text(raw);
        if text.is_empty() {
            return Err(AppError::Validation("Option cannot be empty".to_string()));
        }
        if char_len(&text) > self.limits.max_option_length {
            return Err(AppError::Validation(format!(
                "Option is too long (max {} characters)",
                self.limits.max_option_length
            )));
        }
        Ok(text)
    }

    fn clean_options(&self, raw: &[String]) -> AppResult<Vec<String>> {
        let mut cleaned: Vec<String> = Vec::with_capacity(raw.len());
        for text in raw {
            // Blank rows in the form are skipped, not rejected.
            if sanitize_text(text).is_empty() {
                continue;
            }
            let text = self.clean_option(text)?;
            if cleaned.iter().any(|c| c.to_lowercase() == text.to_lowercase()) {
                return Err(AppError::Validation(format!("Duplicate option '{text}'")));
            }
            cleaned.push(text);
        }

        if cleaned.len() < self.limits.min_options {
            return Err(AppError::Validation(format!(
                "A poll needs at least {} options",
                self.limits.min_options
            )));
        }
        if cleaned.len() > self.limits.max_options {
            return Err(AppError::Validation(format!(
                "A poll can have at most {} options",
                self.limits.max_options
            )));
        }
        Ok(cleaned)
    }
}

fn holds_creator_token(view: &PollWithOptions, creator_token: &str) -> bool {
    !creator_token.is_empty() && hash_token(creator_token) == view.poll.creator_token_hash
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
