//! Nested task tracker engine.
//! Tasks form a forest encoded only by child-id lists. Every structural change is a
//! pure snapshot-to-snapshot transformation, so any storage layer can sit underneath.

pub mod core {
    use chrono::{NaiveDate, Weekday};
    use serde::{Deserialize, Serialize};
    use serde_with::{DisplayFromStr, serde_as};
    use std::{fmt, num::ParseIntError, str::FromStr};

    /* ------------------------------- IDs ------------------------------- */

    /// Store-assigned identifier. Numeric so the next id can be derived from the
    /// current maximum; carried as a decimal string on the wire.
    #[serde_as]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct TaskId(#[serde_as(as = "DisplayFromStr")] pub u64);

    impl TaskId {
        pub const FIRST: TaskId = TaskId(1);

        pub fn successor(self) -> Self {
            Self(self.0.saturating_add(1))
        }
    }

    impl fmt::Display for TaskId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl FromStr for TaskId {
        type Err = ParseIntError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            s.trim().parse().map(Self)
        }
    }

    impl From<u64> for TaskId {
        fn from(value: u64) -> Self {
            Self(value)
        }
    }

    /* ------------------------------ Entities ------------------------------ */

    /// A node of the task forest. Parentage is never stored on the child; it is
    /// derived from whichever task lists this id in `subtask_ids`.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Task {
        pub id: TaskId,
        pub name: String,
        #[serde(default)]
        pub is_done: bool,
        pub recurrence_rule: RecurrenceRule,
        /// Derived from `recurrence_rule` when the task is created or edited.
        pub due_date: NaiveDate,
        /// Whether completion may later be cleared. Stored, not interpreted.
        #[serde(default)]
        pub resettable: bool,
        /// Child ids in display order.
        #[serde(default)]
        pub subtask_ids: Vec<TaskId>,
    }

    impl Task {
        pub fn lists_child(&self, id: TaskId) -> bool {
            self.subtask_ids.contains(&id)
        }
    }

    /// Payload for a new task; id, completion and children are assigned by the engine.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct TaskDraft {
        pub name: String,
        pub recurrence_rule: RecurrenceRule,
        #[serde(default)]
        pub resettable: bool,
    }

    impl TaskDraft {
        pub fn new(name: impl Into<String>, recurrence_rule: RecurrenceRule) -> Self {
            Self {
                name: name.into(),
                recurrence_rule,
                resettable: false,
            }
        }

        pub fn resettable(mut self, resettable: bool) -> Self {
            self.resettable = resettable;
            self
        }
    }

    /// Field changes for an edit. `None` leaves the field untouched.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct TaskChanges {
        pub name: Option<String>,
        pub recurrence_rule: Option<RecurrenceRule>,
        pub resettable: Option<bool>,
    }

    impl TaskChanges {
        pub fn is_empty(&self) -> bool {
            self.name.is_none() && self.recurrence_rule.is_none() && self.resettable.is_none()
        }
    }

    /// Values merged over the source task when copying.
    pub type CopyOverrides = TaskChanges;

    /* ---------------------------- Value Objects ---------------------------- */

    /// How a task's due date is derived. The kind is stored explicitly rather than
    /// inferred from the shape of an encoded string.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "kind", rename_all = "camelCase")]
    pub enum RecurrenceRule {
        /// A single concrete date.
        SpecificDate { date: NaiveDate },
        /// The first day, today included, that falls on one of these weekdays.
        Weekdays { days: Vec<Weekday> },
        /// A fixed number of days after today.
        AfterDays { days: u32 },
        /// A day of the month, clamped to the month's last day.
        MonthlyDay { day: u8 },
    }

    impl RecurrenceRule {
        /// Weekday rule with the set normalized to Monday..Sunday order, duplicates dropped.
        pub fn weekdays(days: impl IntoIterator<Item = Weekday>) -> Self {
            let mut days: Vec<Weekday> = days.into_iter().collect();
            days.sort_by_key(|d| d.num_days_from_monday());
            days.dedup();
            RecurrenceRule::Weekdays { days }
        }
    }

    impl fmt::Display for RecurrenceRule {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                RecurrenceRule::SpecificDate { date } => write!(f, "on {date}"),
                RecurrenceRule::Weekdays { days } if days.is_empty() => f.write_str("today"),
                RecurrenceRule::Weekdays { days } => {
                    let names: Vec<&str> = days.iter().map(|d| weekday_name(*d)).collect();
                    write!(f, "every {}", names.join(", "))
                }
                RecurrenceRule::AfterDays { days: 1 } => f.write_str("1 day after today"),
                RecurrenceRule::AfterDays { days } => write!(f, "{days} days after today"),
                RecurrenceRule::MonthlyDay { day } => {
                    write!(f, "{day}{} of every month", ordinal_suffix(u32::from(*day)))
                }
            }
        }
    }

    pub fn weekday_name(day: Weekday) -> &'static str {
        match day {
            Weekday::Mon => "Monday",
            Weekday::Tue => "Tuesday",
            Weekday::Wed => "Wednesday",
            Weekday::Thu => "Thursday",
            Weekday::Fri => "Friday",
            Weekday::Sat => "Saturday",
            Weekday::Sun => "Sunday",
        }
    }

    /// English ordinal suffix: 1st, 2nd, 3rd, 4th, 11th, 12th, 13th, 21st, ...
    pub fn ordinal_suffix(n: u32) -> &'static str {
        match (n % 100, n % 10) {
            (11..=13, _) => "th",
            (_, 1) => "st",
            (_, 2) => "nd",
            (_, 3) => "rd",
            _ => "th",
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    /// Why the engine declined an operation or one of its sub-changes. Never fatal:
    /// the snapshot the caller holds is still valid and the call can be retried.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum Rejection {
        #[error("task {0} does not exist")]
        UnknownTask(TaskId),
        #[error("path {0:?} does not resolve to a task")]
        UnresolvedPath(String),
        #[error("task name must not be empty")]
        EmptyName,
        #[error("task {task} cannot be nested under {target}, which lies in its own subtree")]
        Cycle { task: TaskId, target: TaskId },
        #[error("task id {0} is already in use")]
        DuplicateId(TaskId),
        #[error("no records to place")]
        EmptySubtree,
        #[error("record {0} is not linked exactly once inside the subtree being placed")]
        MalformedSubtree(TaskId),
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn ids_travel_as_strings() {
            let json = serde_json::to_string(&TaskId(42)).unwrap();
            assert_eq!(json, "\"42\"");
            let back: TaskId = serde_json::from_str("\"7\"").unwrap();
            assert_eq!(back, TaskId(7));
        }

        #[test]
        fn task_uses_wire_field_names() {
            let task = Task {
                id: TaskId(3),
                name: "Milk".into(),
                is_done: false,
                recurrence_rule: RecurrenceRule::MonthlyDay { day: 2 },
                due_date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
                resettable: true,
                subtask_ids: vec![TaskId(4)],
            };
            let value = serde_json::to_value(&task).unwrap();
            assert_eq!(value["id"], "3");
            assert_eq!(value["isDone"], false);
            assert_eq!(value["dueDate"], "2024-01-02");
            assert_eq!(value["recurrenceRule"]["kind"], "monthlyDay");
            assert_eq!(value["subtaskIds"][0], "4");
            let back: Task = serde_json::from_value(value).unwrap();
            assert_eq!(back, task);
        }

        #[test]
        fn weekday_rules_are_normalized() {
            let rule = RecurrenceRule::weekdays([Weekday::Fri, Weekday::Mon, Weekday::Fri]);
            assert_eq!(
                rule,
                RecurrenceRule::Weekdays {
                    days: vec![Weekday::Mon, Weekday::Fri]
                }
            );
            assert_eq!(rule.to_string(), "every Monday, Friday");
        }

        #[test]
        fn ordinal_suffixes() {
            let rendered: Vec<String> = [1, 2, 3, 4, 11, 12, 13, 21, 22, 23, 28]
                .iter()
                .map(|n| format!("{n}{}", ordinal_suffix(*n)))
                .collect();
            assert_eq!(
                rendered,
                ["1st", "2nd", "3rd", "4th", "11th", "12th", "13th", "21st", "22nd", "23rd", "28th"]
            );
            assert_eq!(
                RecurrenceRule::MonthlyDay { day: 3 }.to_string(),
                "3rd of every month"
            );
        }
    }
}

pub mod recurrence {
    //! Recurrence resolver: total, side-effect-free functions from a rule and "today"
    //! to a concrete date. "Today" always comes from a [`Clock`] so callers stay
    //! deterministic.

    use crate::core::RecurrenceRule;
    use chrono::{Datelike, Days, FixedOffset, Months, NaiveDate, Offset, Utc, Weekday};

    /// Seconds west of UTC for the reference zone (New York standard time).
    pub const REFERENCE_OFFSET_WEST_SECS: i32 = 5 * 3600;

    pub fn next_occurrence(rule: &RecurrenceRule, today: NaiveDate) -> NaiveDate {
        match rule {
            RecurrenceRule::SpecificDate { date } => resolve_specific_date(*date),
            RecurrenceRule::Weekdays { days } => resolve_next_weekday(days, today),
            RecurrenceRule::AfterDays { days } => resolve_after_offset(*days, today),
            RecurrenceRule::MonthlyDay { day } => resolve_monthly_day(*day, today),
        }
    }

    pub fn resolve_specific_date(date: NaiveDate) -> NaiveDate {
        date
    }

    /// Earliest date on or after `today` whose weekday is in `days`; `today` if the set is empty.
    pub fn resolve_next_weekday(days: &[Weekday], today: NaiveDate) -> NaiveDate {
        let from = today.weekday().num_days_from_monday();
        days.iter()
            .map(|d| (d.num_days_from_monday() + 7 - from) % 7)
            .min()
            .and_then(|ahead| today.checked_add_days(Days::new(u64::from(ahead))))
            .unwrap_or(today)
    }

    pub fn resolve_after_offset(days: u32, today: NaiveDate) -> NaiveDate {
        today
            .checked_add_days(Days::new(u64::from(days)))
            .unwrap_or(NaiveDate::MAX)
    }

    /// `day` of the current month if that is not before `today`, otherwise `day` of the
    /// next month. The day is clamped into `1..=last day` of whichever month is used.
    pub fn resolve_monthly_day(day: u8, today: NaiveDate) -> NaiveDate {
        if let Some(date) = clamped_day(today.year(), today.month(), day) {
            if date >= today {
                return date;
            }
        }
        let (year, month) = if today.month() == 12 {
            (today.year() + 1, 1)
        } else {
            (today.year(), today.month() + 1)
        };
        clamped_day(year, month, day).unwrap_or(today)
    }

    pub fn last_day_of_month(year: i32, month: u32) -> Option<u32> {
        let first = NaiveDate::from_ymd_opt(year, month, 1)?;
        let next = first.checked_add_months(Months::new(1))?;
        next.pred_opt().map(|d| d.day())
    }

    fn clamped_day(year: i32, month: u32, day: u8) -> Option<NaiveDate> {
        let last = last_day_of_month(year, month)?;
        NaiveDate::from_ymd_opt(year, month, u32::from(day).clamp(1, last))
    }

    /* ------------------------------- Clock ------------------------------- */

    pub trait Clock: Send + Sync {
        fn today(&self) -> NaiveDate;
    }

    /// Wall clock read in a fixed UTC offset.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SystemClock {
        offset: FixedOffset,
    }

    impl SystemClock {
        pub fn new(offset: FixedOffset) -> Self {
            Self { offset }
        }

        pub fn offset(&self) -> FixedOffset {
            self.offset
        }
    }

    impl Default for SystemClock {
        fn default() -> Self {
            Self::new(reference_offset())
        }
    }

    impl Clock for SystemClock {
        fn today(&self) -> NaiveDate {
            Utc::now().with_timezone(&self.offset).date_naive()
        }
    }

    /// A clock stuck on one date.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FixedClock(pub NaiveDate);

    impl Clock for FixedClock {
        fn today(&self) -> NaiveDate {
            self.0
        }
    }

    pub fn reference_offset() -> FixedOffset {
        FixedOffset::west_opt(REFERENCE_OFFSET_WEST_SECS).unwrap_or_else(|| Utc.fix())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn date(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).unwrap()
        }

        #[test]
        fn weekday_includes_today() {
            // 2024-01-01 is a Monday.
            let today = date(2024, 1, 1);
            assert_eq!(resolve_next_weekday(&[Weekday::Mon], today), today);
            assert_eq!(
                resolve_next_weekday(&[Weekday::Fri, Weekday::Wed], today),
                date(2024, 1, 3)
            );
            assert_eq!(
                resolve_next_weekday(&[Weekday::Sun], date(2024, 1, 2)),
                date(2024, 1, 7)
            );
        }

        #[test]
        fn weekday_wraps_to_next_week() {
            // Saturday -> next Monday.
            assert_eq!(
                resolve_next_weekday(&[Weekday::Mon], date(2024, 1, 6)),
                date(2024, 1, 8)
            );
        }

        #[test]
        fn empty_weekday_set_means_today() {
            assert_eq!(resolve_next_weekday(&[], date(2024, 5, 5)), date(2024, 5, 5));
        }

        #[test]
        fn offset_adds_days_across_months() {
            assert_eq!(resolve_after_offset(3, date(2024, 2, 27)), date(2024, 3, 1));
            assert_eq!(resolve_after_offset(0, date(2024, 2, 27)), date(2024, 2, 27));
        }

        #[test]
        fn monthly_stays_in_month_when_not_past() {
            assert_eq!(resolve_monthly_day(15, date(2024, 3, 10)), date(2024, 3, 15));
            assert_eq!(resolve_monthly_day(10, date(2024, 3, 10)), date(2024, 3, 10));
        }

        #[test]
        fn monthly_rolls_to_next_month_and_year() {
            assert_eq!(resolve_monthly_day(5, date(2024, 3, 10)), date(2024, 4, 5));
            assert_eq!(resolve_monthly_day(1, date(2024, 12, 2)), date(2025, 1, 1));
        }

        #[test]
        fn monthly_clamps_to_last_day() {
            assert_eq!(resolve_monthly_day(31, date(2024, 2, 10)), date(2024, 2, 29));
            assert_eq!(resolve_monthly_day(31, date(2023, 2, 10)), date(2023, 2, 28));
            // Clamped to 30 April, which is today.
            assert_eq!(resolve_monthly_day(31, date(2024, 4, 30)), date(2024, 4, 30));
            assert_eq!(resolve_monthly_day(30, date(2024, 1, 31)), date(2024, 2, 29));
            assert_eq!(resolve_monthly_day(0, date(2024, 6, 1)), date(2024, 6, 1));
        }

        #[test]
        fn rule_dispatch() {
            let today = date(2024, 1, 1);
            let specific = RecurrenceRule::SpecificDate {
                date: date(2020, 1, 1),
            };
            assert_eq!(next_occurrence(&specific, today), date(2020, 1, 1));
            assert_eq!(
                next_occurrence(&RecurrenceRule::AfterDays { days: 7 }, today),
                date(2024, 1, 8)
            );
        }

        #[test]
        fn fixed_clock_is_fixed() {
            let clock = FixedClock(date(2030, 6, 1));
            assert_eq!(clock.today(), date(2030, 6, 1));
            assert_eq!(SystemClock::default().offset().local_minus_utc(), -18_000);
        }
    }
}

pub mod path {
    //! Ordinal path addressing: `"0-2-1"` walks the top-level set (collection order,
    //! never display order) and then successive child lists.

    use crate::core::{Task, TaskId};
    use crate::store::TaskStore;
    use nom::{
        IResult,
        character::complete::{char, digit1},
        combinator::{all_consuming, map_res},
        multi::separated_list1,
    };
    use serde_with::{DeserializeFromStr, SerializeDisplay};
    use std::{collections::HashSet, fmt, str::FromStr};

    /// Zero-based ordinals from the top-level set downwards. Empty means "top level".
    #[derive(
        Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, SerializeDisplay, DeserializeFromStr,
    )]
    pub struct TaskPath(Vec<usize>);

    impl TaskPath {
        pub fn new(ordinals: Vec<usize>) -> Self {
            Self(ordinals)
        }

        pub fn ordinals(&self) -> &[usize] {
            &self.0
        }

        pub fn is_empty(&self) -> bool {
            self.0.is_empty()
        }

        /// Number of ordinals; top-level tasks have depth 1.
        pub fn depth(&self) -> usize {
            self.0.len()
        }

        pub fn child(&self, index: usize) -> Self {
            let mut ordinals = self.0.clone();
            ordinals.push(index);
            Self(ordinals)
        }

        pub fn parent(&self) -> Option<Self> {
            let (_, init) = self.0.split_last()?;
            Some(Self(init.to_vec()))
        }
    }

    impl fmt::Display for TaskPath {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let parts: Vec<String> = self.0.iter().map(|i| i.to_string()).collect();
            f.write_str(&parts.join("-"))
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("invalid task path {0:?}")]
    pub struct InvalidPath(pub String);

    impl FromStr for TaskPath {
        type Err = InvalidPath;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(TaskPath::default());
            }
            all_consuming(ordinals)(trimmed)
                .map(|(_, ordinals)| TaskPath(ordinals))
                .map_err(|_| InvalidPath(s.to_string()))
        }
    }

    fn ordinals(i: &str) -> IResult<&str, Vec<usize>> {
        separated_list1(char('-'), map_res(digit1, |s: &str| s.parse::<usize>()))(i)
    }

    /* ------------------------------ Resolution ------------------------------ */

    /// Outcome of resolving a path string. `TopLevel` (empty path) is distinct from
    /// `NotFound`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Resolved<'a> {
        TopLevel,
        Task(&'a Task),
        NotFound,
    }

    impl<'a> Resolved<'a> {
        pub fn task(self) -> Option<&'a Task> {
            match self {
                Resolved::Task(task) => Some(task),
                Resolved::TopLevel | Resolved::NotFound => None,
            }
        }
    }

    pub fn resolve<'a>(store: &'a TaskStore, path: &str) -> Resolved<'a> {
        match path.parse::<TaskPath>() {
            Ok(parsed) if parsed.is_empty() => Resolved::TopLevel,
            Ok(parsed) => resolve_path(store, &parsed).map_or(Resolved::NotFound, Resolved::Task),
            Err(_) => Resolved::NotFound,
        }
    }

    /// Follow the ordinals; dangling child ids are skipped before indexing.
    pub fn resolve_path<'a>(store: &'a TaskStore, path: &TaskPath) -> Option<&'a Task> {
        let (first, rest) = path.0.split_first()?;
        let mut current = *store.top_level().get(*first)?;
        for ordinal in rest {
            current = *store.subtasks(current).get(*ordinal)?;
        }
        Some(current)
    }

    /// Inverse of [`resolve_path`]: the first path, in resolution order, that reaches `id`.
    pub fn path_of(store: &TaskStore, id: TaskId) -> Option<TaskPath> {
        let mut visited = HashSet::new();
        let mut trail: Vec<usize> = Vec::new();
        // (task, depth, ordinal under its parent), popped in pre-order.
        let mut stack: Vec<(&Task, usize, usize)> = store
            .top_level()
            .into_iter()
            .enumerate()
            .rev()
            .map(|(index, task)| (task, 0, index))
            .collect();
        while let Some((task, depth, index)) = stack.pop() {
            trail.truncate(depth);
            trail.push(index);
            if task.id == id {
                return Some(TaskPath(trail));
            }
            if !visited.insert(task.id) {
                continue;
            }
            for (index, child) in store.subtasks(task).into_iter().enumerate().rev() {
                stack.push((child, depth + 1, index));
            }
        }
        None
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::store::test_support::{forest, task};

        #[test]
        fn parses_and_displays() {
            let path: TaskPath = "0-2-1".parse().unwrap();
            assert_eq!(path.ordinals(), &[0, 2, 1]);
            assert_eq!(path.to_string(), "0-2-1");
            assert_eq!(" 3 ".parse::<TaskPath>().unwrap().ordinals(), &[3]);
            assert!("".parse::<TaskPath>().unwrap().is_empty());
            assert_eq!(path.parent().unwrap().to_string(), "0-2");
            assert_eq!(path.child(4).to_string(), "0-2-1-4");
        }

        #[test]
        fn rejects_malformed_text() {
            for bad in ["0-", "-1", "a", "0--1", "1-x", "0 1"] {
                assert!(bad.parse::<TaskPath>().is_err(), "{bad:?} should not parse");
            }
        }

        #[test]
        fn resolves_through_levels() {
            // 1 -> [2 -> [3]], 4
            let store = forest(vec![
                task(1, "Home", &[2]),
                task(2, "Kitchen", &[3]),
                task(3, "Sink", &[]),
                task(4, "Work", &[]),
            ]);
            assert_eq!(resolve(&store, "0").task().map(|t| t.id.0), Some(1));
            assert_eq!(resolve(&store, "1").task().map(|t| t.id.0), Some(4));
            assert_eq!(resolve(&store, "0-0-0").task().map(|t| t.id.0), Some(3));
            assert_eq!(resolve(&store, ""), Resolved::TopLevel);
            assert_eq!(resolve(&store, "2"), Resolved::NotFound);
            assert_eq!(resolve(&store, "0-1"), Resolved::NotFound);
            assert_eq!(resolve(&store, "0-0-0-0"), Resolved::NotFound);
            assert_eq!(resolve(&store, "garbage"), Resolved::NotFound);
        }

        #[test]
        fn dangling_children_are_skipped_when_indexing() {
            let store = forest(vec![task(1, "Root", &[99, 2]), task(2, "Child", &[])]);
            assert_eq!(resolve(&store, "0-0").task().map(|t| t.id.0), Some(2));
            assert_eq!(path_of(&store, TaskId(2)).unwrap().to_string(), "0-0");
        }

        #[test]
        fn top_level_follows_collection_order_not_names() {
            let store = forest(vec![task(5, "Zebra", &[]), task(2, "Apple", &[])]);
            assert_eq!(resolve(&store, "0").task().map(|t| t.id.0), Some(5));
        }

        #[test]
        fn path_of_inverts_resolution() {
            let store = forest(vec![
                task(1, "A", &[2, 3]),
                task(2, "B", &[]),
                task(3, "C", &[4]),
                task(4, "D", &[]),
                task(5, "E", &[]),
            ]);
            for t in store.iter() {
                let path = path_of(&store, t.id).expect("reachable");
                assert_eq!(resolve_path(&store, &path).map(|x| x.id), Some(t.id));
            }
            assert_eq!(path_of(&store, TaskId(4)).unwrap().to_string(), "0-1-0");
            assert_eq!(path_of(&store, TaskId(42)), None);
        }

        #[test]
        fn path_of_survives_cycles() {
            // 2 and 3 reference each other and nobody else reaches them.
            let store = forest(vec![
                task(1, "A", &[]),
                task(2, "B", &[3]),
                task(3, "C", &[2]),
            ]);
            assert_eq!(path_of(&store, TaskId(2)), None);
            assert_eq!(path_of(&store, TaskId(1)).unwrap().to_string(), "0");
        }

        #[test]
        fn serializes_as_text() {
            let path: TaskPath = "1-0".parse().unwrap();
            assert_eq!(serde_json::to_string(&path).unwrap(), "\"1-0\"");
        }
    }
}

pub mod store {
    //! Hierarchy store: the authoritative collection plus derived views. Only the
    //! engine's own operations get mutable access; everyone else reads.

    use crate::core::{Task, TaskId};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::collections::{HashMap, HashSet};

    /// Tasks keyed by id, in insertion order. Serialized as a flat list of records.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(from = "Vec<Task>", into = "Vec<Task>")]
    pub struct TaskStore {
        tasks: IndexMap<TaskId, Task>,
    }

    impl TaskStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Build from records; a repeated id replaces the earlier record in its slot.
        pub fn from_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
            let mut map = IndexMap::new();
            for task in tasks {
                map.insert(task.id, task);
            }
            Self { tasks: map }
        }

        pub fn len(&self) -> usize {
            self.tasks.len()
        }

        pub fn is_empty(&self) -> bool {
            self.tasks.is_empty()
        }

        pub fn get(&self, id: TaskId) -> Option<&Task> {
            self.tasks.get(&id)
        }

        pub fn contains(&self, id: TaskId) -> bool {
            self.tasks.contains_key(&id)
        }

        pub fn iter(&self) -> impl Iterator<Item = &Task> {
            self.tasks.values()
        }

        /// One greater than the largest id, or 1 for an empty store. Ids that are
        /// only referenced from a `subtask_ids` list count as taken.
        pub fn next_id(&self) -> TaskId {
            self.tasks
                .values()
                .flat_map(|task| std::iter::once(&task.id).chain(&task.subtask_ids))
                .max()
                .map_or(TaskId::FIRST, |id| id.successor())
        }

        /* ---------------------------- Derived views ---------------------------- */

        /// Tasks listed in no task's `subtask_ids`, in collection order.
        pub fn top_level(&self) -> Vec<&Task> {
            let nested: HashSet<TaskId> = self
                .tasks
                .values()
                .flat_map(|t| t.subtask_ids.iter().copied())
                .collect();
            self.tasks
                .values()
                .filter(|t| !nested.contains(&t.id))
                .collect()
        }

        /// Children of `task` that exist, in list order.
        pub fn subtasks(&self, task: &Task) -> Vec<&Task> {
            task.subtask_ids
                .iter()
                .filter_map(|id| self.tasks.get(id))
                .collect()
        }

        pub fn parent_of(&self, id: TaskId) -> Option<&Task> {
            self.tasks.values().find(|t| t.lists_child(id))
        }

        /// child id -> parent id, rebuilt on every call. The first listing parent wins.
        pub fn parent_index(&self) -> HashMap<TaskId, TaskId> {
            let mut index = HashMap::new();
            for task in self.tasks.values() {
                for child in &task.subtask_ids {
                    index.entry(*child).or_insert(task.id);
                }
            }
            index
        }

        /// `id` followed by every transitive descendant, pre-order. Empty when `id` is
        /// unknown. A visited set keeps malformed cycles finite.
        pub fn closure(&self, id: TaskId) -> Vec<TaskId> {
            let mut out = Vec::new();
            let mut visited = HashSet::new();
            let mut stack = vec![id];
            while let Some(next) = stack.pop() {
                if !visited.insert(next) {
                    continue;
                }
                let Some(task) = self.tasks.get(&next) else {
                    continue;
                };
                out.push(next);
                stack.extend(task.subtask_ids.iter().rev().copied());
            }
            out
        }

        /// Whether `candidate` is `root` or lies beneath it.
        pub fn in_subtree(&self, root: TaskId, candidate: TaskId) -> bool {
            self.closure(root).contains(&candidate)
        }

        /* ------------------------------- Audit -------------------------------- */

        pub fn check_invariants(&self) -> Vec<InvariantViolation> {
            let mut out = Vec::new();
            let mut parents: IndexMap<TaskId, Vec<TaskId>> = IndexMap::new();
            for task in self.tasks.values() {
                if task.name.trim().is_empty() {
                    out.push(InvariantViolation::EmptyName(task.id));
                }
                for child in &task.subtask_ids {
                    if !self.tasks.contains_key(child) {
                        out.push(InvariantViolation::DanglingSubtask {
                            parent: task.id,
                            child: *child,
                        });
                    }
                    parents.entry(*child).or_default().push(task.id);
                }
            }
            for (task, listed_by) in parents {
                if listed_by.len() > 1 {
                    out.push(InvariantViolation::MultipleParents {
                        task,
                        parents: listed_by,
                    });
                }
            }
            for task in self.tasks.values() {
                let reaches_itself = task
                    .subtask_ids
                    .iter()
                    .any(|child| self.closure(*child).contains(&task.id));
                if reaches_itself {
                    out.push(InvariantViolation::Cycle(task.id));
                }
            }
            out
        }

        /* ----------------------- Engine-only mutation ------------------------ */

        /// Insert, or replace in place keeping the slot.
        pub(crate) fn put(&mut self, task: Task) {
            self.tasks.insert(task.id, task);
        }

        pub(crate) fn remove(&mut self, id: TaskId) -> Option<Task> {
            self.tasks.shift_remove(&id)
        }

        pub(crate) fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
            self.tasks.get_mut(&id)
        }

        pub(crate) fn tasks_mut(&mut self) -> impl Iterator<Item = &mut Task> {
            self.tasks.values_mut()
        }
    }

    impl From<Vec<Task>> for TaskStore {
        fn from(tasks: Vec<Task>) -> Self {
            Self::from_tasks(tasks)
        }
    }

    impl From<TaskStore> for Vec<Task> {
        fn from(store: TaskStore) -> Self {
            store.tasks.into_values().collect()
        }
    }

    impl FromIterator<Task> for TaskStore {
        fn from_iter<I: IntoIterator<Item = Task>>(iter: I) -> Self {
            Self::from_tasks(iter)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum InvariantViolation {
        #[error("task {parent} lists missing subtask {child}")]
        DanglingSubtask { parent: TaskId, child: TaskId },
        #[error("task {task} is listed by more than one parent: {parents:?}")]
        MultipleParents { task: TaskId, parents: Vec<TaskId> },
        #[error("task {0} is its own descendant")]
        Cycle(TaskId),
        #[error("task {0} has an empty name")]
        EmptyName(TaskId),
    }


    #[cfg(test)]
    mod tests {
        use super::test_support::{forest, task};
        use super::*;

        fn ids(tasks: Vec<&Task>) -> Vec<u64> {
            tasks.into_iter().map(|t| t.id.0).collect()
        }

        #[test]
        fn next_id_is_max_plus_one() {
            assert_eq!(TaskStore::new().next_id(), TaskId(1));
            let store = forest(vec![task(3, "a", &[]), task(10, "b", &[]), task(7, "c", &[])]);
            assert_eq!(store.next_id(), TaskId(11));
        }

        #[test]
        fn next_id_skips_ids_that_are_only_referenced() {
            let store = forest(vec![task(1, "a", &[4])]);
            assert_eq!(store.next_id(), TaskId(5));
        }

        #[test]
        fn top_level_excludes_listed_children() {
            let store = forest(vec![
                task(1, "a", &[3]),
                task(2, "b", &[]),
                task(3, "c", &[]),
            ]);
            assert_eq!(ids(store.top_level()), vec![1, 2]);
        }

        #[test]
        fn closure_is_preorder_and_cycle_safe() {
            let store = forest(vec![
                task(1, "a", &[2, 4]),
                task(2, "b", &[3]),
                task(3, "c", &[1]),
                task(4, "d", &[99]),
            ]);
            let closure: Vec<u64> = store.closure(TaskId(1)).iter().map(|i| i.0).collect();
            assert_eq!(closure, vec![1, 2, 3, 4]);
            assert!(store.closure(TaskId(42)).is_empty());
            assert!(store.in_subtree(TaskId(2), TaskId(1)));
        }

        #[test]
        fn parent_lookups() {
            let store = forest(vec![task(1, "a", &[2]), task(2, "b", &[])]);
            assert_eq!(store.parent_of(TaskId(2)).map(|t| t.id), Some(TaskId(1)));
            assert_eq!(store.parent_of(TaskId(1)), None);
            assert_eq!(store.parent_index().get(&TaskId(2)), Some(&TaskId(1)));
        }

        #[test]
        fn audit_reports_each_violation() {
            let store = forest(vec![
                task(1, "a", &[2, 9]),
                task(2, "b", &[1]),
                task(3, " ", &[2]),
            ]);
            let violations = store.check_invariants();
            assert!(violations.contains(&InvariantViolation::DanglingSubtask {
                parent: TaskId(1),
                child: TaskId(9)
            }));
            assert!(violations.contains(&InvariantViolation::MultipleParents {
                task: TaskId(2),
                parents: vec![TaskId(1), TaskId(3)]
            }));
            assert!(violations.contains(&InvariantViolation::Cycle(TaskId(1))));
            assert!(violations.contains(&InvariantViolation::EmptyName(TaskId(3))));
            assert!(forest(vec![task(1, "a", &[2]), task(2, "b", &[])])
                .check_invariants()
                .is_empty());
        }

        #[test]
        fn serializes_as_flat_list_in_order() {
            let store = forest(vec![task(2, "b", &[]), task(1, "a", &[2])]);
            let json = serde_json::to_value(&store).unwrap();
            assert_eq!(json[0]["id"], "2");
            assert_eq!(json[1]["subtaskIds"][0], "2");
            let back: TaskStore = serde_json::from_value(json).unwrap();
            assert_eq!(back, store);
        }
    }
}

pub mod ops {
    //! Structural operations. Each takes a snapshot by reference and returns the next
    //! snapshot together with the records a persistence layer has to write. The input
    //! snapshot is never touched, and a rejected call leaves nothing behind.

    pub use crate::core::Rejection;
    use crate::core::{CopyOverrides, Task, TaskChanges, TaskDraft, TaskId};
    use crate::path::{self, Resolved};
    use crate::recurrence::next_occurrence;
    use crate::store::TaskStore;
    use chrono::NaiveDate;
    use std::collections::{HashMap, HashSet};
    use tracing::{debug, warn};

    /* ------------------------------ Outcomes ------------------------------ */

    /// New records placed by insert, copy or attach.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Insertion {
        pub store: TaskStore,
        /// The placed root.
        pub root: Task,
        /// Records beneath the root, pre-order.
        pub descendants: Vec<Task>,
        /// The parent whose child list gained the root, as it now reads.
        pub parent: Option<Task>,
    }

    impl Insertion {
        /// Root first, then descendants.
        pub fn records(&self) -> Vec<Task> {
            std::iter::once(&self.root)
                .chain(&self.descendants)
                .cloned()
                .collect()
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Edit {
        pub store: TaskStore,
        pub task: Task,
        /// Tasks whose child lists changed because of a re-parent.
        pub modified_parents: Vec<Task>,
        /// Sub-changes that were refused while the rest of the edit applied.
        pub rejected: Vec<Rejection>,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Deletion {
        pub store: TaskStore,
        /// The removed closure, pre-order.
        pub removed: Vec<TaskId>,
        pub modified_parents: Vec<Task>,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Toggle {
        pub store: TaskStore,
        /// The status applied to the whole closure.
        pub is_done: bool,
        /// Tasks whose flag actually flipped, pre-order.
        pub changed: Vec<Task>,
    }

    /* ------------------------------ Insertion ------------------------------ */

    /// Create one task from `draft`. A parent path that does not resolve falls back to
    /// the top level.
    pub fn insert(
        store: &TaskStore,
        draft: TaskDraft,
        parent_path: Option<&str>,
        today: NaiveDate,
    ) -> Result<Insertion, Rejection> {
        validate_name(&draft.name)?;
        let task = Task {
            id: store.next_id(),
            due_date: next_occurrence(&draft.recurrence_rule, today),
            name: draft.name,
            is_done: false,
            recurrence_rule: draft.recurrence_rule,
            resettable: draft.resettable,
            subtask_ids: Vec::new(),
        };
        attach(store, vec![task], parent_path)
    }

    /// Duplicate the task at `source_path`. The root takes its fields from the source
    /// with `overrides` merged over them; with `copy_descendants` every descendant is
    /// cloned too, keeping name, rule and resettable. All copies start incomplete and
    /// get fresh ids and due dates.
    pub fn copy(
        store: &TaskStore,
        source_path: &str,
        overrides: CopyOverrides,
        parent_path: Option<&str>,
        copy_descendants: bool,
        today: NaiveDate,
    ) -> Result<Insertion, Rejection> {
        let source = path::resolve(store, source_path)
            .task()
            .ok_or_else(|| Rejection::UnresolvedPath(source_path.to_string()))?;
        let rule = overrides
            .recurrence_rule
            .unwrap_or_else(|| source.recurrence_rule.clone());
        let name = overrides.name.unwrap_or_else(|| source.name.clone());
        validate_name(&name)?;

        let next_id = store.next_id();
        let mut subtree = vec![Task {
            id: next_id,
            name,
            is_done: false,
            due_date: next_occurrence(&rule, today),
            recurrence_rule: rule,
            resettable: overrides.resettable.unwrap_or(source.resettable),
            subtask_ids: Vec::new(),
        }];
        if copy_descendants {
            clone_descendants(store, source, today, next_id, &mut subtree);
        }
        debug!(source = %source.id, records = subtree.len(), "copying task");
        attach(store, subtree, parent_path)
    }

    /// Append fresh copies of every task below `source` to `out` (whose first record
    /// is the root's copy), in pre-order with consecutive ids after `last_id`.
    fn clone_descendants(
        store: &TaskStore,
        source: &Task,
        today: NaiveDate,
        mut last_id: TaskId,
        out: &mut Vec<Task>,
    ) {
        let mut visited = HashSet::from([source.id]);
        // (original, index of the parent's copy in `out`)
        let mut stack: Vec<(&Task, usize)> =
            store.subtasks(source).into_iter().rev().map(|child| (child, 0)).collect();
        while let Some((original, parent_index)) = stack.pop() {
            if !visited.insert(original.id) {
                continue;
            }
            last_id = last_id.successor();
            let index = out.len();
            out.push(Task {
                id: last_id,
                name: original.name.clone(),
                is_done: false,
                recurrence_rule: original.recurrence_rule.clone(),
                due_date: next_occurrence(&original.recurrence_rule, today),
                resettable: original.resettable,
                subtask_ids: Vec::new(),
            });
            if let Some(parent) = out.get_mut(parent_index) {
                parent.subtask_ids.push(last_id);
            }
            for child in store.subtasks(original).into_iter().rev() {
                stack.push((child, index));
            }
        }
    }

    /// Place an already-built subtree (root first, children linked by id inside it)
    /// under `parent_path`. Ids must be unused and every non-root record must be
    /// listed exactly once inside the subtree.
    pub fn attach(
        store: &TaskStore,
        subtree: Vec<Task>,
        parent_path: Option<&str>,
    ) -> Result<Insertion, Rejection> {
        let parent = match parent_path.map(|p| path::resolve(store, p)) {
            None | Some(Resolved::TopLevel) => None,
            Some(Resolved::Task(parent)) => Some(parent.id),
            Some(Resolved::NotFound) => {
                warn!(
                    path = parent_path.unwrap_or_default(),
                    "parent path did not resolve; placing task at top level"
                );
                None
            }
        };
        attach_under(store, subtree, parent)
    }

    /// [`attach`] with the parent already resolved. `None` places the root at the
    /// top level; an unknown parent id is rejected.
    pub fn attach_under(
        store: &TaskStore,
        subtree: Vec<Task>,
        parent: Option<TaskId>,
    ) -> Result<Insertion, Rejection> {
        let mut records = subtree.into_iter();
        let Some(root) = records.next() else {
            return Err(Rejection::EmptySubtree);
        };
        let descendants: Vec<Task> = records.collect();
        validate_subtree(store, &root, &descendants)?;
        if let Some(id) = parent.filter(|id| !store.contains(*id)) {
            return Err(Rejection::UnknownTask(id));
        }

        let mut next = store.clone();
        let updated_parent = parent.and_then(|id| {
            let parent = next.get_mut(id)?;
            parent.subtask_ids.push(root.id);
            Some(parent.clone())
        });
        next.put(root.clone());
        for task in &descendants {
            next.put(task.clone());
        }
        debug!(task = %root.id, parent = ?parent, nested = descendants.len(), "placed task");
        Ok(Insertion {
            store: next,
            root,
            descendants,
            parent: updated_parent,
        })
    }

    fn validate_subtree(
        store: &TaskStore,
        root: &Task,
        descendants: &[Task],
    ) -> Result<(), Rejection> {
        // A dangling child id would adopt a new record that reuses it.
        let referenced: HashSet<TaskId> = store
            .iter()
            .flat_map(|task| task.subtask_ids.iter().copied())
            .collect();
        let mut members = HashSet::new();
        for task in std::iter::once(root).chain(descendants) {
            validate_name(&task.name)?;
            if store.contains(task.id) || referenced.contains(&task.id) || !members.insert(task.id) {
                return Err(Rejection::DuplicateId(task.id));
            }
        }
        let mut listed = HashSet::new();
        for task in std::iter::once(root).chain(descendants) {
            for child in &task.subtask_ids {
                if !members.contains(child) {
                    return Err(Rejection::UnknownTask(*child));
                }
                if *child == root.id || !listed.insert(*child) {
                    return Err(Rejection::MalformedSubtree(*child));
                }
            }
        }
        match descendants.iter().find(|t| !listed.contains(&t.id)) {
            Some(orphan) => Err(Rejection::MalformedSubtree(orphan.id)),
            None => Ok(()),
        }
    }

    /* -------------------------------- Edit -------------------------------- */

    /// Apply field changes and optionally move the task. The move target is resolved
    /// against the snapshot before the edit. A blank name or an invalid move target is
    /// reported in [`Edit::rejected`] and the remaining changes still apply.
    pub fn edit(
        store: &TaskStore,
        id: TaskId,
        changes: TaskChanges,
        new_parent_path: Option<&str>,
        today: NaiveDate,
    ) -> Result<Edit, Rejection> {
        let current = store.get(id).ok_or(Rejection::UnknownTask(id))?;
        let mut rejected = Vec::new();
        let mut task = current.clone();
        if let Some(name) = changes.name {
            match validate_name(&name) {
                Ok(()) => task.name = name,
                Err(rejection) => rejected.push(rejection),
            }
        }
        if let Some(rule) = changes.recurrence_rule {
            task.due_date = next_occurrence(&rule, today);
            task.recurrence_rule = rule;
        }
        if let Some(resettable) = changes.resettable {
            task.resettable = resettable;
        }

        let mut next = store.clone();
        next.put(task.clone());
        let mut touched: Vec<TaskId> = Vec::new();
        if let Some(target_path) = new_parent_path {
            match reparent_target(store, id, target_path) {
                Ok(target) => {
                    for parent in next.tasks_mut() {
                        if parent.lists_child(id) {
                            parent.subtask_ids.retain(|child| *child != id);
                            touched.push(parent.id);
                        }
                    }
                    if let Some(parent) = target.and_then(|t| next.get_mut(t)) {
                        parent.subtask_ids.push(id);
                        if !touched.contains(&parent.id) {
                            touched.push(parent.id);
                        }
                    }
                }
                Err(rejection) => rejected.push(rejection),
            }
        }
        for rejection in &rejected {
            warn!(task = %id, reason = %rejection, "edit sub-change rejected");
        }

        let modified_parents = touched
            .iter()
            .filter_map(|parent| next.get(*parent).cloned())
            .collect();
        let task = next.get(id).cloned().unwrap_or(task);
        debug!(task = %id, moved = !touched.is_empty(), "edited task");
        Ok(Edit {
            store: next,
            task,
            modified_parents,
            rejected,
        })
    }

    /// `None` is the top level.
    fn reparent_target(
        store: &TaskStore,
        id: TaskId,
        target_path: &str,
    ) -> Result<Option<TaskId>, Rejection> {
        match path::resolve(store, target_path) {
            Resolved::TopLevel => Ok(None),
            Resolved::NotFound => Err(Rejection::UnresolvedPath(target_path.to_string())),
            Resolved::Task(target) if store.in_subtree(id, target.id) => Err(Rejection::Cycle {
                task: id,
                target: target.id,
            }),
            Resolved::Task(target) => Ok(Some(target.id)),
        }
    }

    /* -------------------------- Delete and toggle -------------------------- */

    /// Remove the task and its whole closure, and scrub every removed id from the
    /// child lists of the survivors.
    pub fn delete(store: &TaskStore, id: TaskId) -> Result<Deletion, Rejection> {
        if !store.contains(id) {
            return Err(Rejection::UnknownTask(id));
        }
        let removed = store.closure(id);
        let doomed: HashSet<TaskId> = removed.iter().copied().collect();
        let mut next = store.clone();
        for gone in &removed {
            next.remove(*gone);
        }
        let mut modified_parents = Vec::new();
        for task in next.tasks_mut() {
            if task.subtask_ids.iter().any(|child| doomed.contains(child)) {
                task.subtask_ids.retain(|child| !doomed.contains(child));
                modified_parents.push(task.clone());
            }
        }
        debug!(task = %id, removed = removed.len(), "deleted subtree");
        Ok(Deletion {
            store: next,
            removed,
            modified_parents,
        })
    }

    /// Flip the task's completion and apply the new value to every descendant.
    pub fn toggle_status(store: &TaskStore, id: TaskId) -> Result<Toggle, Rejection> {
        let task = store.get(id).ok_or(Rejection::UnknownTask(id))?;
        let is_done = !task.is_done;
        let mut next = store.clone();
        let mut changed = Vec::new();
        for member in store.closure(id) {
            if let Some(task) = next.get_mut(member) {
                if task.is_done != is_done {
                    task.is_done = is_done;
                    changed.push(task.clone());
                }
            }
        }
        debug!(task = %id, is_done, changed = changed.len(), "toggled subtree");
        Ok(Toggle {
            store: next,
            is_done,
            changed,
        })
    }

    /* ------------------------------- Helpers ------------------------------- */

    /// Rewrite record ids and child references through `ids`; unmapped ids stay.
    pub fn relabel(records: &[Task], ids: &HashMap<TaskId, TaskId>) -> Vec<Task> {
        records.iter().map(|task| relabel_task(task, ids)).collect()
    }

    pub fn relabel_task(task: &Task, ids: &HashMap<TaskId, TaskId>) -> Task {
        let map = |id: TaskId| ids.get(&id).copied().unwrap_or(id);
        Task {
            id: map(task.id),
            subtask_ids: task.subtask_ids.iter().map(|child| map(*child)).collect(),
            ..task.clone()
        }
    }

    fn validate_name(name: &str) -> Result<(), Rejection> {
        if name.trim().is_empty() {
            Err(Rejection::EmptyName)
        } else {
            Ok(())
        }
    }

}

pub mod projectors {
    pub mod agenda_projector {
        //! Presentation projection: due/future buckets with roll-up of overdue
        //! descendants, and the display sort. Paths stay structural; only the order
        //! in which nodes are listed follows the sort.

        use crate::core::{Task, TaskId};
        use crate::path::TaskPath;
        use crate::store::TaskStore;
        use chrono::NaiveDate;
        use serde::Serialize;
        use std::{cmp::Ordering, collections::HashSet};

        #[derive(Debug, Clone, PartialEq, Eq, Default)]
        pub struct Buckets<'a> {
            pub due: Vec<&'a Task>,
            pub future: Vec<&'a Task>,
        }

        /// Split `tasks` by [`is_due_with_subtasks`], preserving input order.
        pub fn categorize<'a>(
            store: &TaskStore,
            tasks: impl IntoIterator<Item = &'a Task>,
            today: NaiveDate,
        ) -> Buckets<'a> {
            let mut buckets = Buckets::default();
            for task in tasks {
                if is_due_with_subtasks(store, task, today) {
                    buckets.due.push(task);
                } else {
                    buckets.future.push(task);
                }
            }
            buckets
        }

        pub fn is_due(task: &Task, today: NaiveDate) -> bool {
            task.due_date <= today
        }

        /// Due when the task or any transitive descendant is due.
        pub fn is_due_with_subtasks(store: &TaskStore, task: &Task, today: NaiveDate) -> bool {
            is_due(task, today)
                || store
                    .closure(task.id)
                    .iter()
                    .filter_map(|id| store.get(*id))
                    .any(|t| is_due(t, today))
        }

        /// Incomplete before complete, then by name ignoring case.
        pub fn compare_tasks(a: &Task, b: &Task) -> Ordering {
            compare_keys(a.is_done, &a.name, b.is_done, &b.name)
        }

        /// Stable, so equal keys keep their input order.
        pub fn sort_tasks(tasks: &mut [&Task]) {
            tasks.sort_by(|a, b| compare_tasks(a, b));
        }

        fn compare_keys(a_done: bool, a_name: &str, b_done: bool, b_name: &str) -> Ordering {
            a_done
                .cmp(&b_done)
                .then_with(|| a_name.to_lowercase().cmp(&b_name.to_lowercase()))
                .then_with(|| a_name.cmp(b_name))
        }

        /* ------------------------------- View ------------------------------- */

        #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
        #[serde(rename_all = "camelCase")]
        pub struct TaskNode {
            pub id: TaskId,
            pub path: TaskPath,
            pub name: String,
            pub is_done: bool,
            pub due_date: NaiveDate,
            pub recurrence: String,
            pub resettable: bool,
            pub children: Vec<TaskNode>,
        }

        impl Drop for TaskNode {
            // Flattened so a deep chain does not recurse through the drop glue.
            fn drop(&mut self) {
                let mut pending = std::mem::take(&mut self.children);
                while let Some(mut node) = pending.pop() {
                    pending.append(&mut node.children);
                }
            }
        }

        #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
        pub struct AgendaView {
            pub due: Vec<TaskNode>,
            pub future: Vec<TaskNode>,
        }

        impl AgendaView {
            pub fn is_empty(&self) -> bool {
                self.due.is_empty() && self.future.is_empty()
            }
        }

        pub fn project(store: &TaskStore, today: NaiveDate) -> AgendaView {
            let mut view = AgendaView::default();
            for (index, task) in store.top_level().into_iter().enumerate() {
                let node = build_node(store, task, TaskPath::new(vec![index]));
                if is_due_with_subtasks(store, task, today) {
                    view.due.push(node);
                } else {
                    view.future.push(node);
                }
            }
            sort_nodes(&mut view.due);
            sort_nodes(&mut view.future);
            view
        }

        fn build_node(store: &TaskStore, root: &Task, path: TaskPath) -> TaskNode {
            let mut visited = HashSet::new();
            // Pre-order, so every node sits after its parent.
            let mut flat: Vec<(TaskNode, Option<usize>)> = Vec::new();
            let mut stack = vec![(root, path, None)];
            while let Some((task, path, parent)) = stack.pop() {
                if !visited.insert(task.id) {
                    continue;
                }
                let index = flat.len();
                for (ordinal, child) in store.subtasks(task).into_iter().enumerate().rev() {
                    stack.push((child, path.child(ordinal), Some(index)));
                }
                flat.push((leaf(task, path), parent));
            }
            // Folding from the back completes each node before it joins its parent.
            // Siblings arrive last-first.
            let mut root_node = None;
            while let Some((mut node, parent)) = flat.pop() {
                node.children.reverse();
                sort_nodes(&mut node.children);
                match parent.and_then(|index| flat.get_mut(index)) {
                    Some((parent, _)) => parent.children.push(node),
                    None => root_node = Some(node),
                }
            }
            root_node.unwrap_or_else(|| leaf(root, TaskPath::default()))
        }

        fn leaf(task: &Task, path: TaskPath) -> TaskNode {
            TaskNode {
                id: task.id,
                path,
                name: task.name.clone(),
                is_done: task.is_done,
                due_date: task.due_date,
                recurrence: task.recurrence_rule.to_string(),
                resettable: task.resettable,
                children: Vec::new(),
            }
        }

        fn sort_nodes(nodes: &mut [TaskNode]) {
            nodes.sort_by(|a, b| compare_keys(a.is_done, &a.name, b.is_done, &b.name));
        }

    }

    pub mod outline_projector {
        //! Structural outline: every reachable task in collection order with its path
        //! and depth.

        use crate::core::TaskId;
        use crate::path::TaskPath;
        use crate::store::TaskStore;
        use serde::Serialize;
        use std::collections::HashSet;

        #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
        #[serde(rename_all = "camelCase")]
        pub struct OutlineEntry {
            pub path: TaskPath,
            /// Zero for top-level tasks.
            pub depth: usize,
            pub id: TaskId,
            pub name: String,
            pub is_done: bool,
        }

        pub fn outline(store: &TaskStore) -> Vec<OutlineEntry> {
            let mut out = Vec::new();
            let mut visited = HashSet::new();
            let mut stack: Vec<(TaskId, TaskPath)> = store
                .top_level()
                .into_iter()
                .enumerate()
                .rev()
                .map(|(i, t)| (t.id, TaskPath::new(vec![i])))
                .collect();
            while let Some((id, path)) = stack.pop() {
                let Some(task) = store.get(id) else { continue };
                if !visited.insert(id) {
                    continue;
                }
                let children = store.subtasks(task);
                for (i, child) in children.into_iter().enumerate().rev() {
                    stack.push((child.id, path.child(i)));
                }
                out.push(OutlineEntry {
                    depth: path.depth().saturating_sub(1),
                    path,
                    id,
                    name: task.name.clone(),
                    is_done: task.is_done,
                });
            }
            out
        }

    }
}

pub mod format {
    //! Plain-text rendering of projections.

    use crate::projectors::agenda_projector::{AgendaView, TaskNode};
    use crate::projectors::outline_projector::OutlineEntry;
    use std::fmt::Write;

    pub const DUE_HEADING: &str = "Due today or earlier";
    pub const FUTURE_HEADING: &str = "Future";

    pub fn format_agenda(view: &AgendaView) -> String {
        if view.is_empty() {
            return "No tasks.\n".to_string();
        }
        let mut out = String::new();
        for (heading, nodes) in [(DUE_HEADING, &view.due), (FUTURE_HEADING, &view.future)] {
            if nodes.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push('\n');
            }
            let _ = writeln!(out, "{heading}");
            for node in nodes {
                write_node(&mut out, node, 1);
            }
        }
        out
    }

    fn write_node(out: &mut String, node: &TaskNode, depth: usize) {
        let mut stack = vec![(node, depth)];
        while let Some((node, depth)) = stack.pop() {
            let mark = if node.is_done { 'x' } else { ' ' };
            let _ = writeln!(
                out,
                "{:<8}{}[{mark}] {} (due {}, {})",
                node.path.to_string(),
                "  ".repeat(depth - 1),
                node.name,
                node.due_date,
                node.recurrence
            );
            stack.extend(node.children.iter().rev().map(|child| (child, depth + 1)));
        }
    }

    pub fn format_outline(entries: &[OutlineEntry]) -> String {
        let mut out = String::new();
        for entry in entries {
            let _ = writeln!(
                out,
                "{:<8}{}→ {}",
                entry.path.to_string(),
                "  ".repeat(entry.depth),
                entry.name
            );
        }
        out
    }

}

pub mod legacy {
    //! Codec for the older record layout that packed the rule kind into a string:
    //! `"date"` for a concrete date, `"monthlyN"` for a day of the month, or a
    //! comma-separated list of weekday names.

    use crate::core::{RecurrenceRule, Task, TaskId, weekday_name};
    use chrono::{NaiveDate, Weekday};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::tag,
        character::complete::{char, digit1, space0},
        combinator::{all_consuming, map, map_res, value},
        multi::separated_list1,
        sequence::{preceded, tuple},
    };
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct LegacyTask {
        #[serde(rename = "_id")]
        pub id: String,
        pub task_name: String,
        #[serde(default)]
        pub is_done: bool,
        pub carry_out_on: String,
        /// `YYYY-MM-DD`.
        pub date_of_carry_out: String,
        #[serde(default)]
        pub can_be_reseted: bool,
        #[serde(default)]
        pub list_of_sub_tasks: Vec<String>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum LegacyError {
        #[error("record id {0:?} is not numeric")]
        InvalidId(String),
        #[error("record {id}: invalid date {value:?}")]
        InvalidDate { id: String, value: String },
        #[error("record {id}: unrecognised rule {value:?}")]
        InvalidRule { id: String, value: String },
    }

    /// Decode the packed rule. `"date"` takes the record's own date.
    pub fn decode_rule(encoded: &str, date: NaiveDate) -> Option<RecurrenceRule> {
        all_consuming(rule(date))(encoded.trim())
            .ok()
            .map(|(_, rule)| rule)
    }

    pub fn encode_rule(rule: &RecurrenceRule) -> String {
        match rule {
            // Offsets were always materialised as a concrete date.
            RecurrenceRule::SpecificDate { .. } | RecurrenceRule::AfterDays { .. } => {
                "date".to_string()
            }
            RecurrenceRule::MonthlyDay { day } => format!("monthly{day}"),
            RecurrenceRule::Weekdays { days } => {
                let names: Vec<&str> = days.iter().map(|d| weekday_name(*d)).collect();
                names.join(", ")
            }
        }
    }

    fn rule(date: NaiveDate) -> impl FnMut(&str) -> IResult<&str, RecurrenceRule> {
        move |i: &str| {
            alt((
                value(RecurrenceRule::SpecificDate { date }, tag("date")),
                map(
                    preceded(tag("monthly"), map_res(digit1, |s: &str| s.parse::<u8>())),
                    |day| RecurrenceRule::MonthlyDay { day },
                ),
                map(
                    separated_list1(tuple((char(','), space0)), weekday),
                    |days| RecurrenceRule::weekdays(days),
                ),
            ))(i)
        }
    }

    fn weekday(i: &str) -> IResult<&str, Weekday> {
        alt((
            value(Weekday::Mon, tag("Monday")),
            value(Weekday::Tue, tag("Tuesday")),
            value(Weekday::Wed, tag("Wednesday")),
            value(Weekday::Thu, tag("Thursday")),
            value(Weekday::Fri, tag("Friday")),
            value(Weekday::Sat, tag("Saturday")),
            value(Weekday::Sun, tag("Sunday")),
        ))(i)
    }

    impl TryFrom<LegacyTask> for Task {
        type Error = LegacyError;

        fn try_from(record: LegacyTask) -> Result<Self, Self::Error> {
            let id = parse_id(&record.id)?;
            let due_date = NaiveDate::parse_from_str(record.date_of_carry_out.trim(), "%Y-%m-%d")
                .map_err(|_| LegacyError::InvalidDate {
                    id: record.id.clone(),
                    value: record.date_of_carry_out.clone(),
                })?;
            let recurrence_rule = decode_rule(&record.carry_out_on, due_date).ok_or_else(|| {
                LegacyError::InvalidRule {
                    id: record.id.clone(),
                    value: record.carry_out_on.clone(),
                }
            })?;
            let subtask_ids = record
                .list_of_sub_tasks
                .iter()
                .map(|child| parse_id(child))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Task {
                id,
                name: record.task_name,
                is_done: record.is_done,
                recurrence_rule,
                due_date,
                resettable: record.can_be_reseted,
                subtask_ids,
            })
        }
    }

    impl From<&Task> for LegacyTask {
        fn from(task: &Task) -> Self {
            Self {
                id: task.id.to_string(),
                task_name: task.name.clone(),
                is_done: task.is_done,
                carry_out_on: encode_rule(&task.recurrence_rule),
                date_of_carry_out: task.due_date.format("%Y-%m-%d").to_string(),
                can_be_reseted: task.resettable,
                list_of_sub_tasks: task.subtask_ids.iter().map(|c| c.to_string()).collect(),
            }
        }
    }

    pub fn import(records: Vec<LegacyTask>) -> Result<Vec<Task>, LegacyError> {
        records.into_iter().map(Task::try_from).collect()
    }

    fn parse_id(raw: &str) -> Result<TaskId, LegacyError> {
        raw.parse()
            .map_err(|_| LegacyError::InvalidId(raw.to_string()))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn day() -> NaiveDate {
            NaiveDate::from_ymd_opt(2023, 5, 17).unwrap()
        }

        #[test]
        fn decodes_each_shape() {
            assert_eq!(
                decode_rule("date", day()),
                Some(RecurrenceRule::SpecificDate { date: day() })
            );
            assert_eq!(
                decode_rule("monthly28", day()),
                Some(RecurrenceRule::MonthlyDay { day: 28 })
            );
            assert_eq!(
                decode_rule("Friday, Monday", day()),
                Some(RecurrenceRule::Weekdays {
                    days: vec![Weekday::Mon, Weekday::Fri]
                })
            );
            assert_eq!(
                decode_rule("Tuesday,Thursday", day()),
                Some(RecurrenceRule::Weekdays {
                    days: vec![Weekday::Tue, Weekday::Thu]
                })
            );
        }

        #[test]
        fn rejects_unknown_shapes() {
            for bad in ["", "monthly", "monthlyx", "Funday", "dates", "Monday,", "monthly999"] {
                assert_eq!(decode_rule(bad, day()), None, "{bad:?}");
            }
        }

        #[test]
        fn converts_records() {
            let json = r#"[
                {"_id":"1","taskName":"Groceries","isDone":false,"carryOutOn":"Monday, Friday",
                 "dateOfCarryOut":"2023-05-19","canBeReseted":true,"listOfSubTasks":["2"]},
                {"_id":"2","taskName":"Milk","isDone":true,"carryOutOn":"date",
                 "dateOfCarryOut":"2023-05-17","canBeReseted":false,"listOfSubTasks":[]}
            ]"#;
            let records: Vec<LegacyTask> = serde_json::from_str(json).unwrap();
            let tasks = import(records).unwrap();
            assert_eq!(tasks[0].subtask_ids, vec![TaskId(2)]);
            assert!(tasks[0].resettable);
            assert!(tasks[1].is_done);
            assert_eq!(tasks[1].due_date, day());

            let back = LegacyTask::from(&tasks[0]);
            assert_eq!(back.carry_out_on, "Monday, Friday");
            assert_eq!(back.id, "1");
        }

        #[test]
        fn reports_bad_records() {
            let mut record = LegacyTask {
                id: "abc".into(),
                task_name: "x".into(),
                is_done: false,
                carry_out_on: "date".into(),
                date_of_carry_out: "2023-05-17".into(),
                can_be_reseted: false,
                list_of_sub_tasks: vec![],
            };
            assert_eq!(
                Task::try_from(record.clone()),
                Err(LegacyError::InvalidId("abc".into()))
            );
            record.id = "4".into();
            record.carry_out_on = "whenever".into();
            assert!(matches!(
                Task::try_from(record),
                Err(LegacyError::InvalidRule { .. })
            ));
        }

        #[test]
        fn offsets_encode_as_dates() {
            assert_eq!(encode_rule(&RecurrenceRule::AfterDays { days: 3 }), "date");
        }
    }
}

pub mod storage {
    //! Remote record store seam. The engine only needs create, read-all, update and
    //! delete; everything structural happens in memory in [`crate::ops`].

    use crate::core::{RecurrenceRule, Task, TaskId};
    use crate::store::TaskStore;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};
    use std::{
        io::ErrorKind,
        path::{Path, PathBuf},
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
    };
    use tokio::{
        fs,
        sync::{Mutex, RwLock},
    };
    use tracing::{debug, warn};

    /* ------------------------------ Payloads ------------------------------ */

    /// Every field of a record except the id, which the store assigns.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct NewTask {
        pub name: String,
        pub is_done: bool,
        pub recurrence_rule: RecurrenceRule,
        pub due_date: NaiveDate,
        pub resettable: bool,
        pub subtask_ids: Vec<TaskId>,
    }

    impl NewTask {
        pub fn with_id(self, id: TaskId) -> Task {
            Task {
                id,
                name: self.name,
                is_done: self.is_done,
                recurrence_rule: self.recurrence_rule,
                due_date: self.due_date,
                resettable: self.resettable,
                subtask_ids: self.subtask_ids,
            }
        }
    }

    impl From<&Task> for NewTask {
        fn from(task: &Task) -> Self {
            Self {
                name: task.name.clone(),
                is_done: task.is_done,
                recurrence_rule: task.recurrence_rule.clone(),
                due_date: task.due_date,
                resettable: task.resettable,
                subtask_ids: task.subtask_ids.clone(),
            }
        }
    }

    /// Changed fields only.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct TaskPatch {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub is_done: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub recurrence_rule: Option<RecurrenceRule>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub due_date: Option<NaiveDate>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub resettable: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub subtask_ids: Option<Vec<TaskId>>,
    }

    impl TaskPatch {
        /// The fields that differ between two versions of the same record.
        pub fn between(before: &Task, after: &Task) -> Self {
            fn changed<T: PartialEq + Clone>(a: &T, b: &T) -> Option<T> {
                (a != b).then(|| b.clone())
            }
            Self {
                name: changed(&before.name, &after.name),
                is_done: changed(&before.is_done, &after.is_done),
                recurrence_rule: changed(&before.recurrence_rule, &after.recurrence_rule),
                due_date: changed(&before.due_date, &after.due_date),
                resettable: changed(&before.resettable, &after.resettable),
                subtask_ids: changed(&before.subtask_ids, &after.subtask_ids),
            }
        }

        pub fn status(is_done: bool) -> Self {
            Self {
                is_done: Some(is_done),
                ..Self::default()
            }
        }

        pub fn subtasks(task: &Task) -> Self {
            Self {
                subtask_ids: Some(task.subtask_ids.clone()),
                ..Self::default()
            }
        }

        pub fn is_empty(&self) -> bool {
            *self == Self::default()
        }

        pub fn apply(&self, task: &mut Task) {
            if let Some(name) = &self.name {
                task.name = name.clone();
            }
            if let Some(is_done) = self.is_done {
                task.is_done = is_done;
            }
            if let Some(rule) = &self.recurrence_rule {
                task.recurrence_rule = rule.clone();
            }
            if let Some(due_date) = self.due_date {
                task.due_date = due_date;
            }
            if let Some(resettable) = self.resettable {
                task.resettable = resettable;
            }
            if let Some(subtask_ids) = &self.subtask_ids {
                task.subtask_ids = subtask_ids.clone();
            }
        }
    }

    /* ------------------------------- Errors ------------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum StorageError {
        #[error("task {0} not found in the remote store")]
        NotFound(TaskId),
        #[error("task id {0} already exists in the remote store")]
        Conflict(TaskId),
        #[error("remote store I/O failed for {path:?}")]
        Io {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("remote store data is not valid JSON")]
        Serde(#[from] serde_json::Error),
        #[error("remote store unavailable: {0}")]
        Unavailable(String),
    }

    impl StorageError {
        /// Transient failures worth retrying unchanged.
        pub fn is_retryable(&self) -> bool {
            matches!(self, StorageError::Io { .. } | StorageError::Unavailable(_))
        }
    }

    /* ------------------------------- Trait -------------------------------- */

    #[async_trait]
    pub trait RemoteTaskStore: Send + Sync {
        /// Store a record and return it with its assigned id.
        async fn create(&self, task: NewTask) -> Result<Task, StorageError>;
        async fn read_all(&self) -> Result<Vec<Task>, StorageError>;
        /// Apply `patch` and return the updated record.
        async fn update(&self, id: TaskId, patch: TaskPatch) -> Result<Task, StorageError>;
        async fn delete(&self, id: TaskId) -> Result<(), StorageError>;
    }

    fn apply_update(
        records: &mut TaskStore,
        id: TaskId,
        patch: &TaskPatch,
    ) -> Result<Task, StorageError> {
        let task = records.get_mut(id).ok_or(StorageError::NotFound(id))?;
        patch.apply(task);
        Ok(task.clone())
    }

    fn apply_create(records: &mut TaskStore, task: NewTask) -> Task {
        let task = task.with_id(records.next_id());
        records.put(task.clone());
        task
    }

    /* --------------------------- Memory store ---------------------------- */

    /// In-process store; clones share the same records.
    #[derive(Debug, Clone)]
    pub struct MemoryTaskStore {
        records: Arc<RwLock<TaskStore>>,
        available: Arc<AtomicBool>,
    }

    impl Default for MemoryTaskStore {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MemoryTaskStore {
        pub fn new() -> Self {
            Self::with_tasks(Vec::new())
        }

        pub fn with_tasks(tasks: Vec<Task>) -> Self {
            Self {
                records: Arc::new(RwLock::new(TaskStore::from_tasks(tasks))),
                available: Arc::new(AtomicBool::new(true)),
            }
        }

        /// While unavailable every call fails with [`StorageError::Unavailable`].
        pub fn set_available(&self, available: bool) {
            self.available.store(available, Ordering::SeqCst);
        }

        pub async fn snapshot(&self) -> Vec<Task> {
            self.records.read().await.iter().cloned().collect()
        }

        fn ensure_available(&self) -> Result<(), StorageError> {
            if self.available.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(StorageError::Unavailable("memory store switched off".into()))
            }
        }
    }

    #[async_trait]
    impl RemoteTaskStore for MemoryTaskStore {
        async fn create(&self, task: NewTask) -> Result<Task, StorageError> {
            self.ensure_available()?;
            let mut records = self.records.write().await;
            Ok(apply_create(&mut records, task))
        }

        async fn read_all(&self) -> Result<Vec<Task>, StorageError> {
            self.ensure_available()?;
            Ok(self.snapshot().await)
        }

        async fn update(&self, id: TaskId, patch: TaskPatch) -> Result<Task, StorageError> {
            self.ensure_available()?;
            let mut records = self.records.write().await;
            apply_update(&mut records, id, &patch)
        }

        async fn delete(&self, id: TaskId) -> Result<(), StorageError> {
            self.ensure_available()?;
            let mut records = self.records.write().await;
            records.remove(id).map(|_| ()).ok_or(StorageError::NotFound(id))
        }
    }

    /* ---------------------------- File store ----------------------------- */

    /// Records kept in one JSON file, rewritten atomically after every change.
    #[derive(Debug)]
    pub struct JsonFileTaskStore {
        path: PathBuf,
        records: RwLock<TaskStore>,
        persist_lock: Mutex<()>,
    }

    impl JsonFileTaskStore {
        /// Open `path`; a missing file is an empty store.
        pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
            let path = path.into();
            let records = match fs::read_to_string(&path).await {
                Ok(text) if text.trim().is_empty() => TaskStore::new(),
                Ok(text) => serde_json::from_str(&text)?,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!(path = %path.display(), "no data file yet, starting empty");
                    TaskStore::new()
                }
                Err(source) => return Err(StorageError::Io { path, source }),
            };
            Ok(Self {
                path,
                records: RwLock::new(records),
                persist_lock: Mutex::new(()),
            })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        /// Add already-identified records, refusing any id that is taken.
        pub async fn import(&self, tasks: Vec<Task>) -> Result<usize, StorageError> {
            self.mutate(|records| {
                for task in &tasks {
                    if records.contains(task.id) {
                        return Err(StorageError::Conflict(task.id));
                    }
                }
                let count = tasks.len();
                for task in tasks {
                    records.put(task);
                }
                Ok(count)
            })
            .await
        }

        async fn mutate<T>(
            &self,
            change: impl FnOnce(&mut TaskStore) -> Result<T, StorageError>,
        ) -> Result<T, StorageError> {
            let _guard = self.persist_lock.lock().await;
            let mut next = self.records.read().await.clone();
            let out = change(&mut next)?;
            self.persist(&next).await?;
            *self.records.write().await = next;
            Ok(out)
        }

        async fn persist(&self, records: &TaskStore) -> Result<(), StorageError> {
            let io = |source: std::io::Error| StorageError::Io {
                path: self.path.clone(),
                source,
            };
            if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(dir).await.map_err(io)?;
            }
            let json = serde_json::to_string_pretty(records)?;
            let tmp = self.path.with_extension("json.tmp");
            fs::write(&tmp, json).await.map_err(io)?;
            if let Err(source) = fs::rename(&tmp, &self.path).await {
                warn!(path = %tmp.display(), "could not move data file into place");
                return Err(io(source));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RemoteTaskStore for JsonFileTaskStore {
        async fn create(&self, task: NewTask) -> Result<Task, StorageError> {
            self.mutate(|records| Ok(apply_create(records, task))).await
        }

        async fn read_all(&self) -> Result<Vec<Task>, StorageError> {
            Ok(self.records.read().await.iter().cloned().collect())
        }

        async fn update(&self, id: TaskId, patch: TaskPatch) -> Result<Task, StorageError> {
            self.mutate(|records| apply_update(records, id, &patch)).await
        }

        async fn delete(&self, id: TaskId) -> Result<(), StorageError> {
            self.mutate(|records| {
                records
                    .remove(id)
                    .map(|_| ())
                    .ok_or(StorageError::NotFound(id))
            })
            .await
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::store::test_support::task;

        #[tokio::test]
        async fn memory_store_assigns_ids_and_patches() {
            let store = MemoryTaskStore::with_tasks(vec![task(4, "a", &[])]);
            let created = store.create(NewTask::from(&task(0, "b", &[]))).await.unwrap();
            assert_eq!(created.id, TaskId(5));
            let updated = store
                .update(TaskId(4), TaskPatch::subtasks(&task(4, "a", &[5])))
                .await
                .unwrap();
            assert_eq!(updated.subtask_ids, vec![TaskId(5)]);
            assert_eq!(updated.name, "a");
            store.delete(TaskId(5)).await.unwrap();
            assert!(matches!(
                store.delete(TaskId(5)).await,
                Err(StorageError::NotFound(TaskId(5)))
            ));
            assert_eq!(store.read_all().await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn unavailable_memory_store_fails_retryably() {
            let store = MemoryTaskStore::new();
            store.set_available(false);
            let err = store.read_all().await.unwrap_err();
            assert!(err.is_retryable());
        }

        #[test]
        fn patch_between_lists_only_changes() {
            let before = task(1, "a", &[]);
            let mut after = before.clone();
            after.is_done = true;
            let patch = TaskPatch::between(&before, &after);
            assert_eq!(patch, TaskPatch::status(true));
            assert!(TaskPatch::between(&before, &before).is_empty());
            let json = serde_json::to_value(&patch).unwrap();
            assert_eq!(json, serde_json::json!({ "isDone": true }));
        }

        #[tokio::test]
        async fn file_store_persists_across_reopen() {
            let dir = tempfile::tempdir().expect("tempdir");
            let path = dir.path().join("nested").join("tasks.json");
            let store = JsonFileTaskStore::open(&path).await.unwrap();
            assert!(store.read_all().await.unwrap().is_empty());
            let created = store.create(NewTask::from(&task(0, "Milk", &[]))).await.unwrap();
            assert_eq!(created.id, TaskId(1));
            store
                .update(created.id, TaskPatch::status(true))
                .await
                .unwrap();

            let reopened = JsonFileTaskStore::open(&path).await.unwrap();
            let tasks = reopened.read_all().await.unwrap();
            assert_eq!(tasks.len(), 1);
            assert!(tasks[0].is_done);
            assert!(!path.with_extension("json.tmp").exists());
        }

        #[tokio::test]
        async fn file_store_import_refuses_taken_ids() {
            let dir = tempfile::tempdir().expect("tempdir");
            let store = JsonFileTaskStore::open(dir.path().join("t.json")).await.unwrap();
            assert_eq!(store.import(vec![task(3, "a", &[])]).await.unwrap(), 1);
            assert!(matches!(
                store.import(vec![task(3, "b", &[])]).await,
                Err(StorageError::Conflict(TaskId(3)))
            ));
            assert_eq!(store.read_all().await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn file_store_rejects_corrupt_data() {
            let dir = tempfile::tempdir().expect("tempdir");
            let path = dir.path().join("t.json");
            std::fs::write(&path, "{ not json").unwrap();
            assert!(matches!(
                JsonFileTaskStore::open(&path).await,
                Err(StorageError::Serde(_))
            ));
        }
    }
}

pub mod service {
    //! Ties the engine to a remote store: every operation is computed against the
    //! current snapshot, written remotely, and only then adopted locally. A failed
    //! remote call leaves the local snapshot as it was.

    use crate::core::{CopyOverrides, Task, TaskChanges, TaskDraft, TaskId};
    use crate::ops::{self, Rejection};
    use crate::path;
    use crate::projectors::agenda_projector::{self, AgendaView};
    use crate::recurrence::Clock;
    use crate::storage::{NewTask, RemoteTaskStore, StorageError, TaskPatch};
    use crate::store::TaskStore;
    use chrono::NaiveDate;
    use std::collections::HashMap;
    use tracing::{debug, info};

    #[derive(Debug, thiserror::Error)]
    pub enum ServiceError {
        #[error(transparent)]
        Rejected(#[from] Rejection),
        #[error("remote store call failed")]
        Remote(#[from] StorageError),
    }

    impl ServiceError {
        pub fn is_retryable(&self) -> bool {
            match self {
                ServiceError::Rejected(_) => false,
                ServiceError::Remote(err) => err.is_retryable(),
            }
        }
    }

    /// Outcome of an edit as seen by a caller.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Edited {
        pub task: Task,
        pub rejected: Vec<Rejection>,
    }

    pub struct TaskService<R, C> {
        remote: R,
        clock: C,
        store: TaskStore,
    }

    impl<R: RemoteTaskStore, C: Clock> TaskService<R, C> {
        pub async fn load(remote: R, clock: C) -> Result<Self, ServiceError> {
            let store = TaskStore::from_tasks(remote.read_all().await?);
            debug!(tasks = store.len(), "loaded tasks");
            Ok(Self {
                remote,
                clock,
                store,
            })
        }

        pub async fn refresh(&mut self) -> Result<(), ServiceError> {
            self.store = TaskStore::from_tasks(self.remote.read_all().await?);
            Ok(())
        }

        pub fn store(&self) -> &TaskStore {
            &self.store
        }

        pub fn remote(&self) -> &R {
            &self.remote
        }

        pub fn today(&self) -> NaiveDate {
            self.clock.today()
        }

        pub fn agenda(&self) -> AgendaView {
            agenda_projector::project(&self.store, self.today())
        }

        pub fn resolve_id(&self, task_path: &str) -> Result<TaskId, ServiceError> {
            path::resolve(&self.store, task_path)
                .task()
                .map(|task| task.id)
                .ok_or_else(|| Rejection::UnresolvedPath(task_path.to_string()).into())
        }

        pub async fn add(
            &mut self,
            draft: TaskDraft,
            parent_path: Option<&str>,
        ) -> Result<Task, ServiceError> {
            let preview = ops::insert(&self.store, draft, parent_path, self.today())?;
            let parent = preview.parent.as_ref().map(|p| p.id);
            self.place(preview.records(), parent).await
        }

        pub async fn copy(
            &mut self,
            source_path: &str,
            overrides: CopyOverrides,
            parent_path: Option<&str>,
            copy_descendants: bool,
        ) -> Result<Task, ServiceError> {
            let preview = ops::copy(
                &self.store,
                source_path,
                overrides,
                parent_path,
                copy_descendants,
                self.today(),
            )?;
            let parent = preview.parent.as_ref().map(|p| p.id);
            self.place(preview.records(), parent).await
        }

        /// Create `records` remotely, deepest first so each parent is sent with the
        /// ids its children were given, then link the root under its parent.
        async fn place(
            &mut self,
            records: Vec<Task>,
            parent: Option<TaskId>,
        ) -> Result<Task, ServiceError> {
            let mut ids = HashMap::new();
            for record in records.iter().rev() {
                let pending = ops::relabel_task(record, &ids);
                let stored = self.remote.create(NewTask::from(&pending)).await?;
                ids.insert(record.id, stored.id);
            }
            let placed = ops::attach_under(&self.store, ops::relabel(&records, &ids), parent)?;
            if let Some(parent) = &placed.parent {
                self.remote
                    .update(parent.id, TaskPatch::subtasks(parent))
                    .await?;
            }
            info!(task = %placed.root.id, records = records.len(), "task stored");
            self.store = placed.store;
            Ok(placed.root)
        }

        pub async fn edit(
            &mut self,
            id: TaskId,
            changes: TaskChanges,
            new_parent_path: Option<&str>,
        ) -> Result<Edited, ServiceError> {
            let outcome = ops::edit(&self.store, id, changes, new_parent_path, self.today())?;
            let mut writes = vec![outcome.task.clone()];
            writes.extend(
                outcome
                    .modified_parents
                    .iter()
                    .filter(|parent| parent.id != id)
                    .cloned(),
            );
            for after in &writes {
                let Some(before) = self.store.get(after.id) else {
                    continue;
                };
                let patch = TaskPatch::between(before, after);
                if !patch.is_empty() {
                    self.remote.update(after.id, patch).await?;
                }
            }
            info!(task = %id, rejected = outcome.rejected.len(), "task edited");
            self.store = outcome.store;
            Ok(Edited {
                task: outcome.task,
                rejected: outcome.rejected,
            })
        }

        /// Remove the task and its subtree; returns the removed ids.
        pub async fn delete(&mut self, id: TaskId) -> Result<Vec<TaskId>, ServiceError> {
            let outcome = ops::delete(&self.store, id)?;
            for gone in &outcome.removed {
                self.remote.delete(*gone).await?;
            }
            for parent in &outcome.modified_parents {
                self.remote
                    .update(parent.id, TaskPatch::subtasks(parent))
                    .await?;
            }
            info!(task = %id, removed = outcome.removed.len(), "task deleted");
            self.store = outcome.store;
            Ok(outcome.removed)
        }

        /// Flip completion for the task and its subtree; returns the new status.
        pub async fn toggle(&mut self, id: TaskId) -> Result<bool, ServiceError> {
            let outcome = ops::toggle_status(&self.store, id)?;
            for task in &outcome.changed {
                self.remote
                    .update(task.id, TaskPatch::status(task.is_done))
                    .await?;
            }
            info!(task = %id, is_done = outcome.is_done, changed = outcome.changed.len(), "task toggled");
            self.store = outcome.store;
            Ok(outcome.is_done)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::RecurrenceRule;
        use crate::recurrence::FixedClock;
        use crate::storage::MemoryTaskStore;

        fn today() -> NaiveDate {
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
        }

        async fn service() -> TaskService<MemoryTaskStore, FixedClock> {
            TaskService::load(MemoryTaskStore::new(), FixedClock(today()))
                .await
                .unwrap()
        }

        fn draft(name: &str) -> TaskDraft {
            TaskDraft::new(name, RecurrenceRule::SpecificDate { date: today() })
        }

        async fn remote_matches_local(service: &TaskService<MemoryTaskStore, FixedClock>) {
            let remote = TaskStore::from_tasks(service.remote().snapshot().await);
            assert_eq!(&remote, service.store());
        }

        #[tokio::test]
        async fn add_nested_task_updates_parent_remotely() {
            let mut service = service().await;
            let groceries = service.add(draft("Groceries"), None).await.unwrap();
            let milk = service.add(draft("Milk"), Some("0")).await.unwrap();
            assert_eq!(
                service.store().get(groceries.id).unwrap().subtask_ids,
                vec![milk.id]
            );
            remote_matches_local(&service).await;
        }

        #[tokio::test]
        async fn unresolved_parent_places_at_top_level_once() {
            let mut service = service().await;
            service.add(draft("Groceries"), None).await.unwrap();
            let stray = service.add(draft("Stray"), Some("4-2")).await.unwrap();
            let copy = service
                .copy("0", CopyOverrides::default(), Some("0-0"), false)
                .await
                .unwrap();
            let top: Vec<TaskId> = service.store().top_level().iter().map(|t| t.id).collect();
            assert_eq!(top, vec![TaskId(1), stray.id, copy.id]);
            remote_matches_local(&service).await;
        }

        #[tokio::test]
        async fn copy_with_descendants_creates_linked_records() {
            let mut service = service().await;
            service.add(draft("Laundry"), None).await.unwrap();
            service.add(draft("Wash"), Some("0")).await.unwrap();
            service.add(draft("Dry"), Some("0-0")).await.unwrap();
            let copy = service
                .copy("0", CopyOverrides::default(), None, true)
                .await
                .unwrap();
            assert_eq!(service.store().len(), 6);
            assert_eq!(service.store().closure(copy.id).len(), 3);
            assert!(service.store().check_invariants().is_empty());
            remote_matches_local(&service).await;
        }

        #[tokio::test]
        async fn edit_move_and_delete_stay_in_sync() {
            let mut service = service().await;
            let a = service.add(draft("a"), None).await.unwrap();
            let b = service.add(draft("b"), None).await.unwrap();
            service.add(draft("c"), Some("0")).await.unwrap();
            let c = service.resolve_id("0-0").unwrap();

            let edited = service
                .edit(c, TaskChanges::default(), Some("1"))
                .await
                .unwrap();
            assert!(edited.rejected.is_empty());
            assert!(service.store().get(a.id).unwrap().subtask_ids.is_empty());
            assert_eq!(service.store().get(b.id).unwrap().subtask_ids, vec![c]);
            remote_matches_local(&service).await;

            let removed = service.delete(b.id).await.unwrap();
            assert_eq!(removed, vec![b.id, c]);
            assert_eq!(service.store().len(), 1);
            remote_matches_local(&service).await;
        }

        #[tokio::test]
        async fn toggle_writes_each_changed_record() {
            let mut service = service().await;
            service.add(draft("a"), None).await.unwrap();
            service.add(draft("b"), Some("0")).await.unwrap();
            let root = service.resolve_id("0").unwrap();
            assert!(service.toggle(root).await.unwrap());
            assert!(service.store().iter().all(|t| t.is_done));
            remote_matches_local(&service).await;
        }

        #[tokio::test]
        async fn remote_failure_leaves_local_snapshot_untouched() {
            let mut service = service().await;
            service.add(draft("a"), None).await.unwrap();
            let before = service.store().clone();
            service.remote().set_available(false);
            let err = service.add(draft("b"), None).await.unwrap_err();
            assert!(err.is_retryable());
            let id = service.resolve_id("0").unwrap();
            assert!(service.toggle(id).await.is_err());
            assert!(service.delete(id).await.is_err());
            assert_eq!(service.store(), &before);
        }

        #[tokio::test]
        async fn rejections_are_not_retryable() {
            let mut service = service().await;
            let err = service.toggle(TaskId(9)).await.unwrap_err();
            assert!(matches!(err, ServiceError::Rejected(Rejection::UnknownTask(_))));
            assert!(!err.is_retryable());
            assert!(service.resolve_id("0").is_err());
        }
    }
}

pub mod config {
    //! Optional TOML configuration. Everything has a default, so a missing file is fine.

    use chrono::FixedOffset;
    use nom::{
        IResult,
        branch::alt,
        character::complete::{char, one_of, satisfy},
        combinator::{all_consuming, map, opt, recognize},
        sequence::{pair, tuple},
    };
    use serde::Deserialize;
    use std::{
        fs, io,
        path::{Path, PathBuf},
    };

    pub const APP_DIR: &str = "tasks";
    pub const CONFIG_FILE_NAME: &str = "config.toml";
    pub const DATA_FILE_NAME: &str = "tasks.json";
    pub const DEFAULT_UTC_OFFSET: &str = "-05:00";

    #[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
    #[serde(default, deny_unknown_fields)]
    pub struct TrackerConfig {
        /// Where records are kept. Defaults to the platform data directory.
        pub data_file: Option<PathBuf>,
        /// Offset used to decide what "today" is, as `+HH:MM`.
        pub utc_offset: Option<String>,
    }

    #[derive(Debug, thiserror::Error)]
    pub enum ConfigError {
        #[error("reading config {path:?}")]
        Read {
            path: PathBuf,
            #[source]
            source: io::Error,
        },
        #[error("parsing config {path:?}")]
        Parse {
            path: PathBuf,
            #[source]
            source: toml::de::Error,
        },
        #[error("invalid utc_offset {0:?}, expected +HH:MM")]
        InvalidOffset(String),
        #[error("no platform data directory; set data_file explicitly")]
        NoDataDir,
    }

    impl TrackerConfig {
        pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
            toml::from_str(text)
        }

        pub fn load(path: &Path) -> Result<Self, ConfigError> {
            let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })
        }

        /// An explicit path must exist; the default location is optional.
        pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
            if let Some(path) = explicit {
                return Self::load(path);
            }
            match Self::default_path() {
                Some(path) if path.exists() => Self::load(&path),
                _ => Ok(Self::default()),
            }
        }

        pub fn default_path() -> Option<PathBuf> {
            dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE_NAME))
        }

        pub fn data_file(&self) -> Result<PathBuf, ConfigError> {
            self.data_file
                .clone()
                .or_else(|| dirs::data_dir().map(|dir| dir.join(APP_DIR).join(DATA_FILE_NAME)))
                .ok_or(ConfigError::NoDataDir)
        }

        pub fn utc_offset(&self) -> Result<FixedOffset, ConfigError> {
            let raw = self.utc_offset.as_deref().unwrap_or(DEFAULT_UTC_OFFSET);
            parse_offset(raw).ok_or_else(|| ConfigError::InvalidOffset(raw.to_string()))
        }
    }

    /// `Z`, `+HH`, `+HHMM` or `+HH:MM`.
    pub fn parse_offset(raw: &str) -> Option<FixedOffset> {
        let (_, seconds) = all_consuming(offset_seconds)(raw.trim()).ok()?;
        FixedOffset::east_opt(seconds)
    }

    fn offset_seconds(i: &str) -> IResult<&str, i32> {
        alt((
            map(char('Z'), |_| 0),
            map(
                tuple((one_of("+-"), two_digits, opt(pair(opt(char(':')), two_digits)))),
                |(sign, hours, minutes)| {
                    let minutes = minutes.map_or(0, |(_, m)| m);
                    let total = hours * 3600 + minutes * 60;
                    if sign == '-' { -total } else { total }
                },
            ),
        ))(i)
    }

    fn two_digits(i: &str) -> IResult<&str, i32> {
        map(
            recognize(pair(
                satisfy(|c| c.is_ascii_digit()),
                satisfy(|c| c.is_ascii_digit()),
            )),
            |digits: &str| digits.bytes().fold(0, |acc, b| acc * 10 + i32::from(b - b'0')),
        )(i)
    }

}
