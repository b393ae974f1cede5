// Copyright 2025 Strata Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error types

use std::fmt;

/// ECS error type
#[derive(Debug, Clone)]
pub enum EcsError {
    /// Entity does not exist or its generation is stale
    EntityNotFound,

    /// Component not present on the entity
    ComponentNotFound,

    /// Type was used without being registered first
    UnknownType(&'static str),

    /// Type was registered under a different category
    InvalidCategory {
        name: &'static str,
        expected: &'static str,
    },

    /// Operation requires a constructor the type was registered without
    MissingConstructor(&'static str),

    /// Adding an ordering constraint would form a cycle
    CycleDetected,

    /// More conditions registered than the scheduler supports
    ConditionLimit,

    /// Query terms could not be unified into a single set of targets
    TermUnification(String),

    /// Command buffer error
    CommandError(String),

    /// Schedule error
    ScheduleError(String),
}

impl fmt::Display for EcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcsError::EntityNotFound => write!(f, "Entity not found"),
            EcsError::ComponentNotFound => write!(f, "Component not found"),
            EcsError::UnknownType(name) => write!(f, "Type '{name}' was never registered"),
            EcsError::InvalidCategory { name, expected } => {
                write!(f, "Type '{name}' is not registered as a {expected}")
            }
            EcsError::MissingConstructor(name) => {
                write!(f, "Type '{name}' lacks the constructor this operation needs")
            }
            EcsError::CycleDetected => write!(f, "Ordering constraint would form a cycle"),
            EcsError::ConditionLimit => write!(f, "Scheduler condition limit exceeded"),
            EcsError::TermUnification(msg) => write!(f, "Query term resolution failed: {msg}"),
            EcsError::CommandError(msg) => write!(f, "Command error: {msg}"),
            EcsError::ScheduleError(msg) => write!(f, "Schedule error: {msg}"),
        }
    }
}

impl std::error::Error for EcsError {}

/// Result type alias
pub type Result<T> = std::result::Result<T, EcsError>;
