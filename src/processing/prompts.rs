//! Per-user custom instructions.

use dashmap::DashMap;
use time::OffsetDateTime;

use super::types::{InvalidPromptError, PromptProfile, UserId};

/// Keyed store of user prompt profiles with a default fallback.
///
/// Each user's entry is updated atomically through its own map shard; no operation locks the
/// whole store, so users never contend on each other's updates.
pub struct PromptStore {
    profiles: DashMap<UserId, PromptProfile>,
    default_instruction: String,
}

impl PromptStore {
    /// Create an empty store that falls back to `default_instruction`.
    pub fn new(default_instruction: impl Into<String>) -> Self {
        Self {
            profiles: DashMap::new(),
            default_instruction: default_instruction.into(),
        }
    }

    /// Instruction used for users without a custom prompt.
    pub fn default_instruction(&self) -> &str {
        &self.default_instruction
    }

    /// Active instruction for `user_id`.
    pub fn get(&self, user_id: &UserId) -> String {
        self.profiles
            .get(user_id)
            .and_then(|profile| profile.custom_instruction.clone())
            .unwrap_or_else(|| self.default_instruction.clone())
    }

    /// Snapshot of the user's profile.
    pub fn profile(&self, user_id: &UserId) -> PromptProfile {
        self.profiles
            .get(user_id)
            .map(|profile| profile.value().clone())
            .unwrap_or_else(|| PromptProfile::default_for(user_id.clone()))
    }

    /// Store a custom instruction, rejecting blank text and leaving the old value intact.
    pub fn set(&self, user_id: &UserId, text: &str) -> Result<PromptProfile, InvalidPromptError> {
        let instruction = text.trim();
        if instruction.is_empty() {
            return Err(InvalidPromptError);
        }

        let profile = PromptProfile {
            user_id: user_id.clone(),
            custom_instruction: Some(instruction.to_string()),
            updated_at: Some(OffsetDateTime::now_utc()),
        };
        self.profiles.insert(user_id.clone(), profile.clone());
        tracing::info!(user_id = %user_id, "Custom prompt set");
        Ok(profile)
    }

    /// Drop the user's custom instruction. Returns whether one was set.
    pub fn reset(&self, user_id: &UserId) -> bool {
        let removed = self.profiles.remove(user_id).is_some();
        if removed {
            tracing::info!(user_id = %user_id, "Prompt reset to default");
        }
        removed
    }
}
