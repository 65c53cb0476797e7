// File: src/ledger/core/ids.rs

//! Identifier types for folders, chats and saved prompts.
//!
//! Identifiers are plain strings on the wire (the persisted document keeps
//! them as JSON strings), wrapped in newtypes so a chat id can never be passed
//! where a folder id is expected. New identifiers are derived from the current
//! time in milliseconds; [`IdSequence`] bumps them forward so two ids issued in
//! the same millisecond never collide.

use core::fmt;
use core::str::FromStr;
use std::convert::Infallible;

use serde::{Deserialize, Serialize};

/// Identifier of the folder that always exists.
pub const DEFAULT_FOLDER_ID: &str = "default";

/// Declare a string newtype with a consistent API.
macro_rules! define_string_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[repr(transparent)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Wrap an existing string identifier.
            #[inline]
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the identifier as a string slice.
            #[inline]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            #[inline]
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            #[inline]
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            #[inline]
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = Infallible;

            #[inline]
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_string()))
            }
        }
    };
}

define_string_id!(
    /// Folder identifier. `"default"` names the protected root folder.
    FolderId
);

impl FolderId {
    /// The identifier of the default folder.
    #[must_use]
    pub fn default_folder() -> Self {
        Self::new(DEFAULT_FOLDER_ID)
    }

    /// Whether this is the protected default folder.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_FOLDER_ID
    }
}

define_string_id!(
    /// Chat identifier, unique across all folders.
    ChatId
);

define_string_id!(
    /// Saved prompt (template) identifier.
    PromptId
);

/// Time-derived identifier source.
///
/// Issues the current Unix time in milliseconds, or one past the last issued
/// value when the clock has not advanced.
#[derive(Debug, Default, Clone)]
pub struct IdSequence {
    last: i64,
}

impl IdSequence {
    /// Create an empty sequence.
    #[must_use]
    pub const fn new() -> Self {
        Self { last: 0 }
    }

    /// Issue the next identifier for the given wall-clock milliseconds.
    pub fn next_at(&mut self, now_ms: i64) -> String {
        self.last = now_ms.max(self.last + 1);
        self.last.to_string()
    }

    /// Issue the next identifier using the current time.
    pub fn next(&mut self) -> String {
        self.next_at(chrono::Utc::now().timestamp_millis())
    }

    /// Issue identifiers until `is_taken` rejects none of them.
    pub fn next_unused(&mut self, is_taken: impl Fn(&str) -> bool) -> String {
        loop {
            let candidate = self.next();
            if !is_taken(&candidate) {
                return candidate;
            }
        }
    }
}
