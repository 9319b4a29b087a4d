//! US state and territory region table.
//!
//! Regions are the unit of fetch work against every origin API. Codes are
//! two-letter postal abbreviations; FIPS codes are kept for origins that
//! filter by numeric state code.

/// A fetchable political region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Two-letter postal code (e.g., `"MD"`).
    pub code: &'static str,
    /// Two-digit FIPS code (e.g., `"24"`).
    pub fips: &'static str,
    /// Full name.
    pub name: &'static str,
}

const fn region(code: &'static str, fips: &'static str, name: &'static str) -> Region {
    Region { code, fips, name }
}

/// The 50 states, DC, and the five inhabited territories, in FIPS order.
pub const REGIONS: &[Region] = &[
    region("AL", "01", "Alabama"),
    region("AK", "02", "Alaska"),
    region("AZ", "04", "Arizona"),
    region("AR", "05", "Arkansas"),
    region("CA", "06", "California"),
    region("CO", "08", "Colorado"),
    region("CT", "09", "Connecticut"),
    region("DE", "10", "Delaware"),
    region("DC", "11", "District of Columbia"),
    region("FL", "12", "Florida"),
    region("GA", "13", "Georgia"),
    region("HI", "15", "Hawaii"),
    region("ID", "16", "Idaho"),
    region("IL", "17", "Illinois"),
    region("IN", "18", "Indiana"),
    region("IA", "19", "Iowa"),
    region("KS", "20", "Kansas"),
    region("KY", "21", "Kentucky"),
    region("LA", "22", "Louisiana"),
    region("ME", "23", "Maine"),
    region("MD", "24", "Maryland"),
    region("MA", "25", "Massachusetts"),
    region("MI", "26", "Michigan"),
    region("MN", "27", "Minnesota"),
    region("MS", "28", "Mississippi"),
    region("MO", "29", "Missouri"),
    region("MT", "30", "Montana"),
    region("NE", "31", "Nebraska"),
    region("NV", "32", "Nevada"),
    region("NH", "33", "New Hampshire"),
    region("NJ", "34", "New Jersey"),
    region("NM", "35", "New Mexico"),
    region("NY", "36", "New York"),
    region("NC", "37", "North Carolina"),
    region("ND", "38", "North Dakota"),
    region("OH", "39", "Ohio"),
    region("OK", "40", "Oklahoma"),
    region("OR", "41", "Oregon"),
    region("PA", "42", "Pennsylvania"),
    region("RI", "44", "Rhode Island"),
    region("SC", "45", "South Carolina"),
    region("SD", "46", "South Dakota"),
    region("TN", "47", "Tennessee"),
    region("TX", "48", "Texas"),
    region("UT", "49", "Utah"),
    region("VT", "50", "Vermont"),
    region("VA", "51", "Virginia"),
    region("WA", "53", "Washington"),
    region("WV", "54", "West Virginia"),
    region("WI", "55", "Wisconsin"),
    region("WY", "56", "Wyoming"),
    region("AS", "60", "American Samoa"),
    region("GU", "66", "Guam"),
    region("MP", "69", "Northern Mariana Islands"),
    region("PR", "72", "Puerto Rico"),
    region("VI", "78", "U.S. Virgin Islands"),
];

/// Looks up a region by postal code (case-insensitive).
#[must_use]
pub fn by_code(code: &str) -> Option<&'static Region> {
    REGIONS.iter().find(|r| r.code.eq_ignore_ascii_case(code))
}

/// Maps a two-digit FIPS code to the postal code.
///
/// Returns `"??"` for unrecognized codes.
#[must_use]
pub fn code_for_fips(fips: &str) -> &'static str {
    REGIONS
        .iter()
        .find(|r| r.fips == fips)
        .map_or("??", |r| r.code)
}

/// All region codes in table order.
#[must_use]
pub fn all_codes() -> Vec<String> {
    REGIONS.iter().map(|r| r.code.to_string()).collect()
}
