//! Core schedule model, shift time math and the canonical schedule store.

use std::collections::HashMap;
use std::fmt;

use chrono::Weekday;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "shiftbook-core";

/// Password given to employees first seen through an ingested row.
pub const DEFAULT_PASSWORD: &str = "password123";

pub const MINUTES_PER_DAY: u32 = 24 * 60;

/// Column headers of the bulk row schema, in export order.
pub const ROW_HEADERS: [&str; 5] = ["Employee", "Site", "Day", "StartTime", "EndTime"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Employee,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employee {
    pub id: String,
    pub name: String,
    pub password: String,
    pub role: Role,
}

impl Employee {
    /// Employee created on first sighting in an ingested row.
    pub fn from_row_name(name: &str) -> Self {
        Self {
            id: slugify(name),
            name: name.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
            role: Role::Employee,
        }
    }
}

/// One scheduled work block. Times are kept as entered; they are only
/// interpreted when a duration is computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shift {
    pub day: String,
    pub site: String,
    pub start_time: String,
    pub end_time: String,
}

impl Shift {
    pub fn new(
        day: impl Into<String>,
        site: impl Into<String>,
        start_time: impl Into<String>,
        end_time: impl Into<String>,
    ) -> Self {
        Self {
            day: day.into(),
            site: site.into(),
            start_time: start_time.into(),
            end_time: end_time.into(),
        }
    }

    pub fn duration_hours(&self) -> f64 {
        duration_hours(&self.start_time, &self.end_time)
    }

    pub fn duration_label(&self) -> String {
        format_duration(self.duration_hours())
    }

    /// Only the exact English day names are recognised.
    pub fn weekday(&self) -> Option<Weekday> {
        match self.day.as_str() {
            "Monday" => Some(Weekday::Mon),
            "Tuesday" => Some(Weekday::Tue),
            "Wednesday" => Some(Weekday::Wed),
            "Thursday" => Some(Weekday::Thu),
            "Friday" => Some(Weekday::Fri),
            "Saturday" => Some(Weekday::Sat),
            "Sunday" => Some(Weekday::Sun),
            _ => None,
        }
    }

    /// Name of the first empty field, in row-schema order.
    pub fn first_missing_field(&self) -> Option<&'static str> {
        [
            ("Site", &self.site),
            ("Day", &self.day),
            ("StartTime", &self.start_time),
            ("EndTime", &self.end_time),
        ]
        .into_iter()
        .find(|(_, value)| value.is_empty())
        .map(|(name, _)| name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRecord {
    pub employee_id: String,
    pub employee_name: String,
    #[serde(alias = "schedule", default)]
    pub shifts: Vec<Shift>,
}

impl ScheduleRecord {
    pub fn new(employee_id: impl Into<String>, employee_name: impl Into<String>) -> Self {
        Self {
            employee_id: employee_id.into(),
            employee_name: employee_name.into(),
            shifts: Vec::new(),
        }
    }

    /// Distinct sites in first-seen order.
    pub fn sites(&self) -> Vec<&str> {
        let mut sites: Vec<&str> = Vec::new();
        for shift in &self.shifts {
            if !sites.contains(&shift.site.as_str()) {
                sites.push(&shift.site);
            }
        }
        sites
    }

    pub fn total_hours(&self) -> f64 {
        self.shifts.iter().map(Shift::duration_hours).sum()
    }
}

pub const DEFAULT_WORKSHEET: &str = "Schedule";

/// Location of the remote sheet used by sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetConfig {
    pub sheet_id: String,
    pub worksheet: String,
}

impl SheetConfig {
    pub fn new(sheet_id: impl Into<String>, worksheet: impl Into<String>) -> Self {
        Self {
            sheet_id: sheet_id.into().trim().to_string(),
            worksheet: worksheet.into().trim().to_string(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.sheet_id.is_empty() && !self.worksheet.is_empty()
    }
}

impl Default for SheetConfig {
    fn default() -> Self {
        Self::new("", DEFAULT_WORKSHEET)
    }
}

/// One tabular input row keyed by the bulk schema headers. Absent and empty
/// cells are both treated as missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRow {
    #[serde(rename = "Employee", default)]
    pub employee: Option<String>,
    #[serde(rename = "Site", default)]
    pub site: Option<String>,
    #[serde(rename = "Day", default)]
    pub day: Option<String>,
    #[serde(rename = "StartTime", default)]
    pub start_time: Option<String>,
    #[serde(rename = "EndTime", default)]
    pub end_time: Option<String>,
}

impl RawRow {
    pub fn new(employee: &str, site: &str, day: &str, start_time: &str, end_time: &str) -> Self {
        Self {
            employee: Some(employee.to_string()),
            site: Some(site.to_string()),
            day: Some(day.to_string()),
            start_time: Some(start_time.to_string()),
            end_time: Some(end_time.to_string()),
        }
    }

    /// Build a row from `(header, value)` pairs. Header matching is exact and
    /// case-sensitive; unknown headers are ignored.
    pub fn from_fields<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut row = Self::default();
        for (header, value) in fields {
            let slot = match header.as_ref() {
                "Employee" => &mut row.employee,
                "Site" => &mut row.site,
                "Day" => &mut row.day,
                "StartTime" => &mut row.start_time,
                "EndTime" => &mut row.end_time,
                _ => continue,
            };
            *slot = Some(value.into());
        }
        row
    }

    pub fn from_shift(employee_name: &str, shift: &Shift) -> Self {
        Self::new(
            employee_name,
            &shift.site,
            &shift.day,
            &shift.start_time,
            &shift.end_time,
        )
    }

    /// Cell values in `ROW_HEADERS` order; missing cells are empty.
    pub fn values(&self) -> [&str; 5] {
        [
            self.employee.as_deref().unwrap_or_default(),
            self.site.as_deref().unwrap_or_default(),
            self.day.as_deref().unwrap_or_default(),
            self.start_time.as_deref().unwrap_or_default(),
            self.end_time.as_deref().unwrap_or_default(),
        ]
    }

    pub fn missing_fields(&self) -> Vec<&'static str> {
        ROW_HEADERS
            .iter()
            .zip(self.values())
            .filter(|(_, value)| value.is_empty())
            .map(|(header, _)| *header)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeParseError {
    #[error("time {0:?} is not of the form H:MM AM|PM")]
    Format(String),
    #[error("hour {0} is outside 1-12")]
    Hour(u32),
    #[error("minute {0} is outside 0-59")]
    Minute(u32),
}

/// Parse a 12-hour clock string (`"3:00 PM"`, `"9 am"`, `"12:30AM"`) into
/// minutes since midnight.
pub fn parse_time_of_day(input: &str) -> Result<u32, TimeParseError> {
    let format_err = || TimeParseError::Format(input.to_string());
    let upper = input.trim().to_ascii_uppercase();
    let (clock, pm) = if let Some(rest) = upper.strip_suffix("AM") {
        (rest, false)
    } else if let Some(rest) = upper.strip_suffix("PM") {
        (rest, true)
    } else {
        return Err(format_err());
    };

    let clock = clock.trim_end();
    let (hour_text, minute_text) = match clock.split_once(':') {
        Some((hour, minute)) => (hour, Some(minute)),
        None => (clock, None),
    };

    if hour_text.is_empty() || hour_text.len() > 2 || !hour_text.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(format_err());
    }
    let hour: u32 = hour_text.parse().map_err(|_| format_err())?;

    let minute: u32 = match minute_text {
        Some(text) if text.len() == 2 && text.bytes().all(|b| b.is_ascii_digit()) => {
            text.parse().map_err(|_| format_err())?
        }
        Some(_) => return Err(format_err()),
        None => 0,
    };

    if !(1..=12).contains(&hour) {
        return Err(TimeParseError::Hour(hour));
    }
    if minute > 59 {
        return Err(TimeParseError::Minute(minute));
    }

    let hour_of_day = hour % 12 + if pm { 12 } else { 0 };
    Ok(hour_of_day * 60 + minute)
}

/// Minutes since midnight, with unparsable input counted as midnight.
fn minutes_or_midnight(time: &str) -> u32 {
    parse_time_of_day(time).unwrap_or_else(|err| {
        debug!(%err, "unparsable shift time, counting as 12:00 AM");
        0
    })
}

/// Shift length in hours. An end at or before the start crosses midnight, so
/// identical endpoints mean a full 24 hours.
pub fn duration_hours(start: &str, end: &str) -> f64 {
    let start_min = minutes_or_midnight(start);
    let mut end_min = minutes_or_midnight(end);
    if end_min <= start_min {
        end_min += MINUTES_PER_DAY;
    }
    f64::from(end_min - start_min) / 60.0
}

/// Render hours rounded to the nearest quarter, e.g. `"8 Hours"`, `"1 Hour"`,
/// `"7.75 Hours"`.
pub fn format_duration(hours: f64) -> String {
    let rounded = (hours * 4.0).round() / 4.0;
    let label = if (rounded - rounded.round()).abs() < 1e-9 {
        format!("{}", rounded.round() as i64)
    } else {
        format!("{rounded}")
    };
    let unit = if rounded == 1.0 { "Hour" } else { "Hours" };
    format!("{label} {unit}")
}

/// Lower-case the name and collapse each whitespace run into one underscore.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut in_whitespace = false;
    for ch in name.to_lowercase().chars() {
        if ch.is_whitespace() {
            if !in_whitespace {
                slug.push('_');
            }
            in_whitespace = true;
        } else {
            slug.push(ch);
            in_whitespace = false;
        }
    }
    slug
}

/// Employees in insertion order, unique by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Employee>", into = "Vec<Employee>")]
pub struct EmployeeTable {
    employees: Vec<Employee>,
    index: HashMap<String, usize>,
}

impl EmployeeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Employee> {
        self.index.get(id).map(|&i| &self.employees[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Insert or replace by id, keeping the original position on replace.
    pub fn upsert(&mut self, employee: Employee) {
        match self.index.get(&employee.id) {
            Some(&i) => self.employees[i] = employee,
            None => {
                self.index.insert(employee.id.clone(), self.employees.len());
                self.employees.push(employee);
            }
        }
    }

    /// Insert only when the id is unknown. Returns whether it was inserted.
    pub fn insert_if_absent(&mut self, employee: Employee) -> bool {
        if self.contains(&employee.id) {
            return false;
        }
        self.upsert(employee);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &Employee> {
        self.employees.iter()
    }

    pub fn len(&self) -> usize {
        self.employees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.employees.is_empty()
    }
}

impl From<Vec<Employee>> for EmployeeTable {
    fn from(employees: Vec<Employee>) -> Self {
        let mut table = Self::new();
        for employee in employees {
            table.upsert(employee);
        }
        table
    }
}

impl From<EmployeeTable> for Vec<Employee> {
    fn from(table: EmployeeTable) -> Self {
        table.employees
    }
}

/// Per-employee shift lists keyed by employee id. Iteration follows insertion
/// order; records only disappear through `clear`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleStore {
    records: Vec<ScheduleRecord>,
    index: HashMap<String, usize>,
}

impl ScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, employee_id: &str) -> Option<&ScheduleRecord> {
        self.index.get(employee_id).map(|&i| &self.records[i])
    }

    fn get_mut(&mut self, employee_id: &str) -> Option<&mut ScheduleRecord> {
        let i = *self.index.get(employee_id)?;
        Some(&mut self.records[i])
    }

    /// Record for `employee_id`, created empty under `employee_name` if absent.
    /// An existing record keeps its first-seen name.
    pub fn upsert_employee(&mut self, employee_id: &str, employee_name: &str) -> &mut ScheduleRecord {
        let i = match self.index.get(employee_id) {
            Some(&i) => i,
            None => {
                let i = self.records.len();
                self.records.push(ScheduleRecord::new(employee_id, employee_name));
                self.index.insert(employee_id.to_string(), i);
                i
            }
        };
        &mut self.records[i]
    }

    /// Append a shift. Returns `false` when there is no record for the id.
    pub fn upsert_shift(&mut self, employee_id: &str, shift: Shift) -> bool {
        match self.get_mut(employee_id) {
            Some(record) => {
                record.shifts.push(shift);
                true
            }
            None => false,
        }
    }

    /// Replace the shift at `index`; out-of-range indexes leave the list as is.
    pub fn replace_shift(&mut self, employee_id: &str, index: usize, shift: Shift) -> bool {
        match self.get_mut(employee_id).and_then(|r| r.shifts.get_mut(index)) {
            Some(slot) => {
                *slot = shift;
                true
            }
            None => false,
        }
    }

    /// Remove the shift at `index`; out-of-range indexes leave the list as is.
    pub fn delete_shift(&mut self, employee_id: &str, index: usize) -> Option<Shift> {
        let record = self.get_mut(employee_id)?;
        if index < record.shifts.len() {
            Some(record.shifts.remove(index))
        } else {
            None
        }
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.index.clear();
    }

    pub fn list_all(&self) -> &[ScheduleRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn total_shifts(&self) -> usize {
        self.records.iter().map(|r| r.shifts.len()).sum()
    }

    /// Insert a whole record under `key`, replacing any record with that key
    /// in place. The key is authoritative for `employee_id`.
    pub fn insert_record(&mut self, key: String, mut record: ScheduleRecord) {
        record.employee_id = key.clone();
        match self.index.get(&key) {
            Some(&i) => self.records[i] = record,
            None => {
                self.index.insert(key, self.records.len());
                self.records.push(record);
            }
        }
    }
}

impl Serialize for ScheduleStore {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.records.len()))?;
        for record in &self.records {
            map.serialize_entry(&record.employee_id, record)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ScheduleStore {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct StoreVisitor;

        impl<'de> Visitor<'de> for StoreVisitor {
            type Value = ScheduleStore;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of employee id to schedule record")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<ScheduleStore, A::Error> {
                let mut store = ScheduleStore::new();
                while let Some((key, record)) = access.next_entry::<String, ScheduleRecord>()? {
                    store.insert_record(key, record);
                }
                Ok(store)
            }
        }

        deserializer.deserialize_map(StoreVisitor)
    }
}

/// Shifts of one site, in their original relative order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteGroup<'a> {
    pub site: &'a str,
    pub shifts: Vec<&'a Shift>,
}

/// Group shifts by site; groups appear in first-seen order.
pub fn group_by_site(shifts: &[Shift]) -> Vec<SiteGroup<'_>> {
    let mut groups: Vec<SiteGroup<'_>> = Vec::new();
    for shift in shifts {
        match groups.iter_mut().find(|g| g.site == shift.site) {
            Some(group) => group.shifts.push(shift),
            None => groups.push(SiteGroup {
                site: &shift.site,
                shifts: vec![shift],
            }),
        }
    }
    groups
}

/// Monday-first stable ordering. Unrecognised day names sort ahead of Monday.
pub fn sort_by_weekday(shifts: &[Shift]) -> Vec<&Shift> {
    let mut sorted: Vec<&Shift> = shifts.iter().collect();
    sorted.sort_by_key(|shift| shift.weekday().map(|d| d.num_days_from_monday()));
    sorted
}

/// Why a bulk row did not produce a shift.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSkip {
    pub missing: Vec<&'static str>,
}

/// Validate one raw row into the employee it names and the shift it carries.
pub fn normalize_row(row: &RawRow) -> Result<(Employee, Shift), RowSkip> {
    let missing = row.missing_fields();
    if !missing.is_empty() {
        return Err(RowSkip { missing });
    }
    let [employee, site, day, start_time, end_time] = row.values();
    Ok((
        Employee::from_row_name(employee),
        Shift::new(day, site, start_time, end_time),
    ))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedRow {
    pub employee_id: String,
    pub employee_created: bool,
}

/// Normalize `row` and append its shift, creating the employee and the
/// schedule record on first sighting. Existing employees are never modified.
pub fn apply_row(
    row: &RawRow,
    employees: &mut EmployeeTable,
    schedules: &mut ScheduleStore,
) -> Result<AppliedRow, RowSkip> {
    let (employee, shift) = normalize_row(row)?;
    let employee_id = employee.id.clone();
    let employee_name = employee.name.clone();
    let employee_created = employees.insert_if_absent(employee);
    schedules
        .upsert_employee(&employee_id, &employee_name)
        .shifts
        .push(shift);
    Ok(AppliedRow {
        employee_id,
        employee_created,
    })
}

/// Deterministic starter data used when no employees are stored.
pub fn seed_data() -> (EmployeeTable, ScheduleStore) {
    let mut employees = EmployeeTable::new();
    for (id, name, password, role) in [
        ("test", "Barret", "test", Role::Employee),
        ("cloud", "Cloud", "password", Role::Employee),
        ("admin", "Admin", "admin", Role::Admin),
    ] {
        employees.upsert(Employee {
            id: id.to_string(),
            name: name.to_string(),
            password: password.to_string(),
            role,
        });
    }

    let mut schedules = ScheduleStore::new();
    let barret = schedules.upsert_employee("test", "Barret");
    for day in ["Monday", "Wednesday", "Thursday"] {
        barret
            .shifts
            .push(Shift::new(day, "Site 1", "3:00 PM", "12:00 AM"));
    }
    let cloud = schedules.upsert_employee("cloud", "Cloud");
    for day in ["Tuesday", "Friday"] {
        cloud
            .shifts
            .push(Shift::new(day, "Site 2", "9:00 AM", "5:00 PM"));
    }

    (employees, schedules)
}
