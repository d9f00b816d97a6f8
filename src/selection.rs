use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// How the submitter picked students: everyone except some, or only some.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub is_selected_all: bool,
    #[serde(default)]
    pub selected_student_ids: Vec<String>,
    #[serde(default)]
    pub unselected_student_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedFlag {
    pub student_id: String,
    pub is_attend: bool,
}

/// Turns a roster and a selection into one attendance flag per roster student,
/// in roster order. Ids outside the roster are ignored.
pub fn resolve(roster: &[String], selection: &Selection) -> EngineResult<Vec<ResolvedFlag>> {
    if !selection.is_selected_all && selection.selected_student_ids.is_empty() {
        return Err(EngineError::InvalidSelection(
            "no students selected".to_string(),
        ));
    }

    let flags = if selection.is_selected_all {
        let unselected: HashSet<&str> = selection
            .unselected_student_ids
            .iter()
            .map(String::as_str)
            .collect();
        roster
            .iter()
            .map(|id| ResolvedFlag {
                student_id: id.clone(),
                is_attend: !unselected.contains(id.as_str()),
            })
            .collect()
    } else {
        let selected: HashSet<&str> = selection
            .selected_student_ids
            .iter()
            .map(String::as_str)
            .collect();
        roster
            .iter()
            .map(|id| ResolvedFlag {
                student_id: id.clone(),
                is_attend: selected.contains(id.as_str()),
            })
            .collect()
    };
    Ok(flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn as_pairs(flags: &[ResolvedFlag]) -> Vec<(&str, bool)> {
        flags
            .iter()
            .map(|f| (f.student_id.as_str(), f.is_attend))
            .collect()
    }

    #[test]
    fn select_all_except_unselected() {
        let sel = Selection {
            is_selected_all: true,
            selected_student_ids: vec![],
            unselected_student_ids: ids(&["2"]),
        };
        let flags = resolve(&ids(&["1", "2", "3", "4"]), &sel).expect("resolve");
        assert_eq!(
            as_pairs(&flags),
            vec![("1", true), ("2", false), ("3", true), ("4", true)]
        );
    }

    #[test]
    fn select_only_selected() {
        let sel = Selection {
            is_selected_all: false,
            selected_student_ids: ids(&["3"]),
            unselected_student_ids: vec![],
        };
        let flags = resolve(&ids(&["1", "2", "3"]), &sel).expect("resolve");
        assert_eq!(as_pairs(&flags), vec![("1", false), ("2", false), ("3", true)]);
    }

    #[test]
    fn ids_outside_roster_are_ignored() {
        let sel = Selection {
            is_selected_all: false,
            selected_student_ids: ids(&["9", "1"]),
            unselected_student_ids: vec![],
        };
        let flags = resolve(&ids(&["1", "2"]), &sel).expect("resolve");
        assert_eq!(as_pairs(&flags), vec![("1", true), ("2", false)]);
    }

    #[test]
    fn empty_explicit_selection_is_rejected() {
        let sel = Selection {
            is_selected_all: false,
            selected_student_ids: vec![],
            unselected_student_ids: ids(&["1"]),
        };
        let err = resolve(&ids(&["1"]), &sel).expect_err("must fail");
        assert!(matches!(err, EngineError::InvalidSelection(_)));
    }
}
