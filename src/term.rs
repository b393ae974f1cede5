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

//! Query terms
//!
//! A term is one atomic constraint of a query. Terms name their entity slots
//! through small integer *targets*; target 0 is the primary entity and
//! [`UNSPECIFIED`] targets are filled in during resolution. Terms derived from
//! the query's argument types are merged with user-supplied extra terms:
//! matching types unify, negative component terms never merge.

use crate::types::DataTypeId;

/// Placeholder for a target the user left open.
pub const UNSPECIFIED: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermKind {
    /// Binds the entity id of a target.
    Entity { target: i32 },
    /// Requires (or excludes, or optionally fetches) a component on a target.
    Component {
        target: i32,
        without: bool,
        optional: bool,
    },
    /// Requires a relation between two targets.
    Relation { from_target: i32, to_target: i32 },
}

/// One atomic query constraint. `ty` is `None` only for entity terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryTerm {
    pub ty: Option<DataTypeId>,
    pub kind: TermKind,
}

impl QueryTerm {
    pub fn entity(target: i32) -> Self {
        Self {
            ty: None,
            kind: TermKind::Entity { target },
        }
    }

    pub fn with(ty: DataTypeId, target: i32) -> Self {
        Self {
            ty: Some(ty),
            kind: TermKind::Component {
                target,
                without: false,
                optional: false,
            },
        }
    }

    pub fn without(ty: DataTypeId, target: i32) -> Self {
        Self {
            ty: Some(ty),
            kind: TermKind::Component {
                target,
                without: true,
                optional: false,
            },
        }
    }

    pub fn opt(ty: DataTypeId, target: i32) -> Self {
        Self {
            ty: Some(ty),
            kind: TermKind::Component {
                target,
                without: false,
                optional: true,
            },
        }
    }

    pub fn related(ty: DataTypeId, from_target: i32, to_target: i32) -> Self {
        Self {
            ty: Some(ty),
            kind: TermKind::Relation {
                from_target,
                to_target,
            },
        }
    }

    pub fn is_entity(&self) -> bool {
        matches!(self.kind, TermKind::Entity { .. })
    }

    pub fn is_component(&self) -> bool {
        matches!(self.kind, TermKind::Component { .. })
    }

    pub fn is_relation(&self) -> bool {
        matches!(self.kind, TermKind::Relation { .. })
    }

    fn same_shape(&self, other: &QueryTerm) -> bool {
        self.ty == other.ty
            && std::mem::discriminant(&self.kind) == std::mem::discriminant(&other.kind)
    }

    fn assign_defaults(&mut self, default_target: &mut i32) {
        match &mut self.kind {
            TermKind::Entity { target } | TermKind::Component { target, .. } => {
                debug_assert_eq!(*target, UNSPECIFIED);
                *target = *default_target;
            }
            TermKind::Relation {
                from_target,
                to_target,
            } => {
                debug_assert_eq!(*from_target, UNSPECIFIED);
                debug_assert_eq!(*to_target, UNSPECIFIED);
                *from_target = *default_target;
                *default_target += 1;
                *to_target = *default_target;
            }
        }
    }

    /// Merge user terms with the terms derived from the query's argument
    /// types. All argument term targets must be [`UNSPECIFIED`]; they are
    /// assigned in place so the fetch layer knows where each argument binds.
    /// Returns the full resolved term list.
    pub fn resolve(base_terms: &[QueryTerm], arg_terms: &mut [QueryTerm]) -> Vec<QueryTerm> {
        let mut terms = Vec::with_capacity(base_terms.len() + arg_terms.len());
        let mut default_target: i32 = 0;
        let mut arg_cursor = 0;

        for base in base_terms {
            let mut base = *base;

            // Negative component terms never merge with argument terms.
            let mergeable = !matches!(base.kind, TermKind::Component { without: true, .. });
            let found = if mergeable {
                (arg_cursor..arg_terms.len()).find(|&j| base.same_shape(&arg_terms[j]))
            } else {
                None
            };

            if let Some(found) = found {
                // Flush the argument terms before the match, each on the
                // running default target.
                for j in arg_cursor..found {
                    arg_terms[j].assign_defaults(&mut default_target);
                    terms.push(arg_terms[j]);
                }

                // Merge: the base term decides the targets, the argument term
                // inherits them (and contributes optionality).
                match (&mut base.kind, &mut arg_terms[found].kind) {
                    (TermKind::Entity { target }, TermKind::Entity { target: arg_target }) => {
                        if *target == UNSPECIFIED {
                            *target = default_target;
                        }
                        *arg_target = *target;
                    }
                    (
                        TermKind::Component {
                            target, optional, ..
                        },
                        TermKind::Component {
                            target: arg_target,
                            optional: arg_optional,
                            ..
                        },
                    ) => {
                        if *target == UNSPECIFIED {
                            *target = default_target;
                        }
                        *optional = *arg_optional;
                        *arg_target = *target;
                    }
                    (
                        TermKind::Relation {
                            from_target,
                            to_target,
                        },
                        TermKind::Relation {
                            from_target: arg_from,
                            to_target: arg_to,
                        },
                    ) => {
                        if *from_target == UNSPECIFIED {
                            *from_target = default_target;
                        }
                        if *to_target == UNSPECIFIED {
                            default_target += 1;
                            *to_target = default_target;
                        }
                        *arg_from = *from_target;
                        *arg_to = *to_target;
                    }
                    _ => unreachable!("same_shape guarantees matching kinds"),
                }
                arg_cursor = found + 1;
            }

            // Update the running default target from the base term, or fill
            // its still-open targets from it.
            match &mut base.kind {
                TermKind::Entity { target } | TermKind::Component { target, .. } => {
                    if *target == UNSPECIFIED {
                        *target = default_target;
                    } else {
                        default_target = *target;
                    }
                }
                TermKind::Relation {
                    from_target,
                    to_target,
                } => {
                    if *from_target == UNSPECIFIED {
                        *from_target = default_target;
                    } else {
                        default_target = *from_target;
                    }
                    if *to_target == UNSPECIFIED {
                        default_target += 1;
                        *to_target = default_target;
                    } else {
                        default_target = *to_target;
                    }
                }
            }

            terms.push(base);
        }

        // Remaining argument terms bind to the running default target.
        for j in arg_cursor..arg_terms.len() {
            arg_terms[j].assign_defaults(&mut default_target);
            terms.push(arg_terms[j]);
        }

        terms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: DataTypeId = DataTypeId(0);
    const B: DataTypeId = DataTypeId(1);
    const R: DataTypeId = DataTypeId(2);

    #[test]
    fn test_args_only_default_to_target_zero() {
        let mut args = vec![QueryTerm::with(A, UNSPECIFIED), QueryTerm::opt(B, UNSPECIFIED)];
        let terms = QueryTerm::resolve(&[], &mut args);

        assert_eq!(terms.len(), 2);
        assert_eq!(terms[0], QueryTerm::with(A, 0));
        assert_eq!(terms[1], QueryTerm::opt(B, 0));
        assert_eq!(args[0], QueryTerm::with(A, 0));
    }

    #[test]
    fn test_relation_arg_advances_target() {
        let mut args = vec![
            QueryTerm::with(A, UNSPECIFIED),
            QueryTerm::related(R, UNSPECIFIED, UNSPECIFIED),
            QueryTerm::with(B, UNSPECIFIED),
        ];
        let terms = QueryTerm::resolve(&[], &mut args);

        assert_eq!(terms[0], QueryTerm::with(A, 0));
        assert_eq!(terms[1], QueryTerm::related(R, 0, 1));
        // Terms after a relation bind to the relation's to target.
        assert_eq!(terms[2], QueryTerm::with(B, 1));
    }

    #[test]
    fn test_base_term_merges_with_arg() {
        let base = vec![QueryTerm::related(R, 0, 1), QueryTerm::with(B, 1)];
        let mut args = vec![
            QueryTerm::with(A, UNSPECIFIED),
            QueryTerm::related(R, UNSPECIFIED, UNSPECIFIED),
        ];
        let terms = QueryTerm::resolve(&base, &mut args);

        // The A argument is flushed before the matching relation term.
        assert_eq!(terms[0], QueryTerm::with(A, 0));
        assert_eq!(terms[1], QueryTerm::related(R, 0, 1));
        assert_eq!(terms[2], QueryTerm::with(B, 1));
        // The argument term learned its targets from the base term.
        assert_eq!(args[1], QueryTerm::related(R, 0, 1));
    }

    #[test]
    fn test_negative_terms_never_merge() {
        let base = vec![QueryTerm::without(A, UNSPECIFIED)];
        let mut args = vec![QueryTerm::with(A, UNSPECIFIED)];
        let terms = QueryTerm::resolve(&base, &mut args);

        // Both terms survive on target 0 instead of merging.
        assert_eq!(terms.len(), 2);
        assert_eq!(terms[0], QueryTerm::without(A, 0));
        assert_eq!(terms[1], QueryTerm::with(A, 0));
    }

    #[test]
    fn test_optionality_comes_from_argument() {
        let base = vec![QueryTerm::with(A, 2)];
        let mut args = vec![QueryTerm::opt(A, UNSPECIFIED)];
        let terms = QueryTerm::resolve(&base, &mut args);

        assert_eq!(terms.len(), 1);
        assert_eq!(terms[0], QueryTerm::opt(A, 2));
        assert_eq!(args[0], QueryTerm::opt(A, 2));
    }
}
