use strum::{Display, EnumCount, EnumIter, IntoStaticStr};
use time::{Date, Duration, Month, OffsetDateTime, Weekday};

const WEEKS_TRACKED: i64 = 4;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumCount, EnumIter, IntoStaticStr,
)]
#[repr(i8)]
pub enum Bucket {
    #[strum(to_string = "Older")]
    Older = -14,
    #[strum(to_string = "Last month")]
    LastMonth = -13,
    #[strum(to_string = "4 weeks ago")]
    WeeksAgo4 = -12,
    #[strum(to_string = "3 weeks ago")]
    WeeksAgo3 = -11,
    #[strum(to_string = "2 weeks ago")]
    WeeksAgo2 = -10,
    #[strum(to_string = "Last week")]
    LastWeek = -9,
    #[strum(to_string = "Monday")]
    Monday = -8,
    #[strum(to_string = "Tuesday")]
    Tuesday = -7,
    #[strum(to_string = "Wednesday")]
    Wednesday = -6,
    #[strum(to_string = "Thursday")]
    Thursday = -5,
    #[strum(to_string = "Friday")]
    Friday = -4,
    #[strum(to_string = "Saturday")]
    Saturday = -3,
    #[strum(to_string = "Sunday")]
    Sunday = -2,
    #[strum(to_string = "Yesterday")]
    Yesterday = -1,
    #[strum(to_string = "Today")]
    Today = 0,
    #[strum(to_string = "Tomorrow")]
    Tomorrow = 1,
    #[strum(to_string = "Coming Monday")]
    ComingMonday = 2,
    #[strum(to_string = "Coming Tuesday")]
    ComingTuesday = 3,
    #[strum(to_string = "Coming Wednesday")]
    ComingWednesday = 4,
    #[strum(to_string = "Coming Thursday")]
    ComingThursday = 5,
    #[strum(to_string = "Coming Friday")]
    ComingFriday = 6,
    #[strum(to_string = "Coming Saturday")]
    ComingSaturday = 7,
    #[strum(to_string = "Coming Sunday")]
    ComingSunday = 8,
    #[strum(to_string = "Next week")]
    NextWeek = 9,
    #[strum(to_string = "In 2 weeks")]
    In2Weeks = 10,
    #[strum(to_string = "In 3 weeks")]
    In3Weeks = 11,
    #[strum(to_string = "In 4 weeks")]
    In4Weeks = 12,
    #[strum(to_string = "Next month")]
    NextMonth = 13,
    #[strum(to_string = "Newer")]
    Newer = 14,
}

impl Bucket {
    pub fn order(self) -> i32 {
        self as i8 as i32
    }

    pub fn name(self) -> &'static str {
        self.into()
    }

    fn past_weekday(weekday: Weekday) -> Self {
        match weekday {
            Weekday::Monday => Bucket::Monday,
            Weekday::Tuesday => Bucket::Tuesday,
            Weekday::Wednesday => Bucket::Wednesday,
            Weekday::Thursday => Bucket::Thursday,
            Weekday::Friday => Bucket::Friday,
            Weekday::Saturday => Bucket::Saturday,
            Weekday::Sunday => Bucket::Sunday,
        }
    }

    fn coming_weekday(weekday: Weekday) -> Self {
        match weekday {
            Weekday::Monday => Bucket::ComingMonday,
            Weekday::Tuesday => Bucket::ComingTuesday,
            Weekday::Wednesday => Bucket::ComingWednesday,
            Weekday::Thursday => Bucket::ComingThursday,
            Weekday::Friday => Bucket::ComingFriday,
            Weekday::Saturday => Bucket::ComingSaturday,
            Weekday::Sunday => Bucket::ComingSunday,
        }
    }

    fn weeks_ago(weeks: i64) -> Self {
        match weeks {
            i64::MIN..=1 => Bucket::LastWeek,
            2 => Bucket::WeeksAgo2,
            3 => Bucket::WeeksAgo3,
            _ => Bucket::WeeksAgo4,
        }
    }

    fn weeks_ahead(weeks: i64) -> Self {
        match weeks {
            i64::MIN..=1 => Bucket::NextWeek,
            2 => Bucket::In2Weeks,
            3 => Bucket::In3Weeks,
            _ => Bucket::In4Weeks,
        }
    }
}

/// Classifies `target` relative to `reference`, comparing calendar days only.
pub fn classify(target: OffsetDateTime, reference: OffsetDateTime) -> Bucket {
    let today = reference.date();
    let day = target.to_offset(reference.offset()).date();
    let day_diff = (today - day).whole_days();
    match day_diff {
        0 => return Bucket::Today,
        1 => return Bucket::Yesterday,
        -1 => return Bucket::Tomorrow,
        _ => {}
    }

    let week_start = start_of_week(today);
    let week_end = week_start.saturating_add(Duration::days(6));
    if day >= week_start && day <= week_end {
        return if day_diff > 0 {
            Bucket::past_weekday(day.weekday())
        } else {
            Bucket::coming_weekday(day.weekday())
        };
    }

    if day_diff > 0 {
        classify_past(day, today, week_start)
    } else {
        classify_future(day, today, week_end)
    }
}

fn classify_past(day: Date, today: Date, week_start: Date) -> Bucket {
    let weeks_back = ((week_start - day).whole_days() - 1) / 7 + 1;
    if same_month(day, today) {
        return Bucket::weeks_ago(weeks_back);
    }
    if weeks_back <= WEEKS_TRACKED || is_adjacent_month(day, today, -1) {
        Bucket::LastMonth
    } else {
        Bucket::Older
    }
}

fn classify_future(day: Date, today: Date, week_end: Date) -> Bucket {
    let weeks_ahead = ((day - week_end).whole_days() - 1) / 7 + 1;
    if same_month(day, today) {
        return Bucket::weeks_ahead(weeks_ahead);
    }
    if weeks_ahead <= WEEKS_TRACKED || is_adjacent_month(day, today, 1) {
        Bucket::NextMonth
    } else {
        Bucket::Newer
    }
}

fn start_of_week(day: Date) -> Date {
    let offset = i64::from(day.weekday().number_days_from_monday());
    day.saturating_sub(Duration::days(offset))
}

fn same_month(a: Date, b: Date) -> bool {
    a.year() == b.year() && a.month() == b.month()
}

/// True when `day` falls in the month `step` months away from `today`
/// (`-1` previous, `1` next), year rollover included.
fn is_adjacent_month(day: Date, today: Date, step: i32) -> bool {
    let (year, month) = match step {
        -1 if today.month() == Month::January => (today.year() - 1, Month::December),
        -1 => (today.year(), today.month().previous()),
        1 if today.month() == Month::December => (today.year() + 1, Month::January),
        1 => (today.year(), today.month().next()),
        _ => return false,
    };
    day.year() == year && day.month() == month
}
