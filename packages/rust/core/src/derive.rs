//! Free, deterministic derivations that make no external call.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};

use leadenrich_shared::normalize::normalize_state;
use leadenrich_shared::{ContactRecord, EnrichError, Field, Result};

use crate::phase::{PhaseCall, PhaseContext};

pub const ZIP_FROM_CITY: &str = "zip-from-city";
pub const AGE_FROM_DOB: &str = "age-from-dob";

/// Representative zip per `(city, state code)`.
const CITY_ZIPS: &[(&str, &str, &str)] = &[
    ("denver", "CO", "80201"),
    ("boulder", "CO", "80301"),
    ("colorado springs", "CO", "80903"),
    ("aurora", "CO", "80010"),
    ("new york", "NY", "10001"),
    ("brooklyn", "NY", "11201"),
    ("los angeles", "CA", "90001"),
    ("san francisco", "CA", "94102"),
    ("san diego", "CA", "92101"),
    ("san jose", "CA", "95101"),
    ("chicago", "IL", "60601"),
    ("houston", "TX", "77001"),
    ("dallas", "TX", "75201"),
    ("austin", "TX", "73301"),
    ("san antonio", "TX", "78201"),
    ("phoenix", "AZ", "85001"),
    ("philadelphia", "PA", "19101"),
    ("seattle", "WA", "98101"),
    ("portland", "OR", "97201"),
    ("boston", "MA", "02108"),
    ("miami", "FL", "33101"),
    ("orlando", "FL", "32801"),
    ("atlanta", "GA", "30301"),
    ("baltimore", "MD", "21201"),
    ("annapolis", "MD", "21401"),
    ("las vegas", "NV", "89101"),
    ("nashville", "TN", "37201"),
    ("minneapolis", "MN", "55401"),
    ("detroit", "MI", "48201"),
    ("salt lake city", "UT", "84101"),
];

/// Date formats accepted for a date of birth.
const DOB_FORMATS: [&str; 4] = ["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d", "%m-%d-%Y"];

/// Zip for a city/state pair, if the table knows it.
pub fn zip_for(city: &str, state: &str) -> Option<&'static str> {
    let city = city.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    let state = normalize_state(state)?;
    CITY_ZIPS
        .iter()
        .find(|(c, s, _)| *c == city && *s == state)
        .map(|(_, _, zip)| *zip)
}

pub fn parse_dob(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let date_part = raw.split(['T', ' ']).next().unwrap_or(raw);
    DOB_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(date_part, fmt).ok())
}

/// Whole years between `dob` and `today`.
pub fn age_on(dob: NaiveDate, today: NaiveDate) -> Option<u32> {
    if dob > today {
        return None;
    }
    let mut years = today.year() - dob.year();
    if (today.month(), today.day()) < (dob.month(), dob.day()) {
        years -= 1;
    }
    u32::try_from(years).ok()
}

pub fn zip_precondition(record: &ContactRecord) -> bool {
    !record.has(Field::Zip) && record.has(Field::City) && record.has(Field::State)
}

pub fn age_precondition(record: &ContactRecord) -> bool {
    !record.has(Field::Age) && record.has(Field::DateOfBirth)
}

/// Static city/state → zip lookup.
pub struct ZipFromCity;

#[async_trait]
impl PhaseCall for ZipFromCity {
    async fn call(&self, record: &ContactRecord, _ctx: &PhaseContext) -> Result<ContactRecord> {
        let city = record.get(Field::City).unwrap_or_default();
        let state = record.get(Field::State).unwrap_or_default();
        let zip = zip_for(city, state)
            .ok_or_else(|| EnrichError::not_found(format!("no zip on file for {city}, {state}")))?;
        Ok(ContactRecord::from_pairs([(Field::Zip, zip)]))
    }
}

/// Age from a date of birth, as of today.
pub struct AgeFromDob;

#[async_trait]
impl PhaseCall for AgeFromDob {
    async fn call(&self, record: &ContactRecord, _ctx: &PhaseContext) -> Result<ContactRecord> {
        let raw = record.get(Field::DateOfBirth).unwrap_or_default();
        let dob = parse_dob(raw)
            .ok_or_else(|| EnrichError::validation(format!("unparseable date of birth '{raw}'")))?;
        let age = age_on(dob, Utc::now().date_naive())
            .ok_or_else(|| EnrichError::validation(format!("date of birth '{raw}' is in the future")))?;
        let age = age.to_string();
        Ok(ContactRecord::from_pairs([(Field::Age, age.as_str())]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zip_lookup_accepts_state_names() {
        assert_eq!(zip_for("Denver", "CO"), Some("80201"));
        assert_eq!(zip_for(" denver ", "Colorado"), Some("80201"));
        assert_eq!(zip_for("Gotham", "NY"), None);
    }

    #[test]
    fn dob_formats() {
        let expected = NaiveDate::from_ymd_opt(1980, 7, 4);
        assert_eq!(parse_dob("1980-07-04"), expected);
        assert_eq!(parse_dob("07/04/1980"), expected);
        assert_eq!(parse_dob("1980-07-04T00:00:00Z"), expected);
        assert_eq!(parse_dob("July 4th"), None);
    }

    #[test]
    fn age_respects_birthday() {
        let dob = NaiveDate::from_ymd_opt(1980, 7, 4).unwrap();
        assert_eq!(age_on(dob, NaiveDate::from_ymd_opt(2026, 7, 3).unwrap()), Some(45));
        assert_eq!(age_on(dob, NaiveDate::from_ymd_opt(2026, 7, 4).unwrap()), Some(46));
        assert_eq!(age_on(dob, NaiveDate::from_ymd_opt(1979, 1, 1).unwrap()), None);
    }

    #[tokio::test]
    async fn zip_phase_produces_zip() {
        let record = ContactRecord::from_pairs([(Field::City, "Denver"), (Field::State, "CO")]);
        assert!(zip_precondition(&record));
        let out = ZipFromCity.call(&record, &PhaseContext::default()).await.unwrap();
        assert_eq!(out.get(Field::Zip), Some("80201"));
    }

    #[tokio::test]
    async fn unknown_city_is_not_found() {
        let record = ContactRecord::from_pairs([(Field::City, "Gotham"), (Field::State, "NY")]);
        let err = ZipFromCity.call(&record, &PhaseContext::default()).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }
}
