// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! The grey-goo fence: a generation counter on every object that rezzed into
//! being from another object, with time-based cooldown so an occasional
//! rezzer (a vendor, a cannon) never saturates while a self-replicating chain
//! hits the ceiling within a few generations.

use serde::{Deserialize, Serialize};

/// Generation at which a rez is refused. Fresh user-rezzed content starts at
/// 0.
pub const MAX_GENERATION: u8 = 5;
/// The fence cools by one generation per this many seconds of quiet.
pub const GENERATION_COOLDOWN_SECS: u64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FenceSettings {
    pub max_generation: u8,
    pub cooldown_secs: u64,
}

impl Default for FenceSettings {
    fn default() -> Self {
        Self {
            max_generation: MAX_GENERATION,
            cooldown_secs: GENERATION_COOLDOWN_SECS,
        }
    }
}

/// The fence-relevant slice of a rezzing object's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RezSourceState {
    pub generation: u8,
    /// Unix seconds the source itself was rezzed/created.
    pub rezzed_at: u64,
    /// Unix seconds the source last rezzed something, if ever.
    pub last_rez: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceOutcome {
    pub allowed: bool,
    /// The source's generation after cooldown decay; write this back even on
    /// refusal so the decay is not lost.
    pub source_generation: u8,
    /// Generation the newly rezzed object carries when allowed.
    pub child_generation: u8,
}

/// Decide whether a rez from `source` may proceed right now, and what
/// generations result. `allow_cooldown` is the region-policy gate; with it
/// off the source generation only ever climbs.
#[must_use]
pub fn check_and_stamp(
    settings: &FenceSettings,
    source: RezSourceState,
    allow_cooldown: bool,
    now: u64,
) -> FenceOutcome {
    let mut generation = source.generation;

    if allow_cooldown {
        let secs_since_rezzed = now.saturating_sub(source.rezzed_at);
        // The significant quiet period: since the last rez if there was one,
        // otherwise since the source itself appeared.
        let quiet = match source.last_rez {
            Some(last) => Some(now.saturating_sub(last)),
            None if secs_since_rezzed > settings.cooldown_secs => Some(secs_since_rezzed),
            None => None,
        };
        if let Some(quiet) = quiet
            && quiet > settings.cooldown_secs
        {
            let cooled = (quiet / settings.cooldown_secs).min(u64::from(u8::MAX)) as u8;
            generation = generation.saturating_sub(cooled);
        }
    }

    let child_generation = generation.saturating_add(1);
    FenceOutcome {
        allowed: child_generation < settings.max_generation,
        source_generation: generation,
        child_generation,
    }
}
