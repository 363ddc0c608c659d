//! Preset migrations.
//!
//! Each preset is configuration only. They all link their records to a
//! shared `companies` collection through `company_id`.

use serde_json::{Map, Value};

use crate::config::{default_target_fields, MigrationSpec, TargetSeed};

/// Collection that receives the created company records.
pub const COMPANIES: &str = "companies";

/// Field on source records that references a company.
pub const COMPANY_REF: &str = "company_id";

/// Tours grouped by license key.
pub fn companies() -> MigrationSpec {
    MigrationSpec::new("companies", "tours", COMPANY_REF, "license_key", COMPANIES)
        .with_target_builder(company_fields)
}

/// Quotations grouped by seller.
pub fn quotation_companies() -> MigrationSpec {
    MigrationSpec::new(
        "quotation_companies",
        "quotations",
        COMPANY_REF,
        "seller_id",
        COMPANIES,
    )
    .with_target_builder(company_fields)
}

/// Followers grouped by license key.
pub fn follower_companies() -> MigrationSpec {
    MigrationSpec::new(
        "follower_companies",
        "followers",
        COMPANY_REF,
        "license_key",
        COMPANIES,
    )
    .with_target_builder(company_fields)
}

/// Every preset, in a fixed order.
pub fn all() -> Vec<MigrationSpec> {
    vec![companies(), quotation_companies(), follower_companies()]
}

/// Look up a preset by name.
pub fn by_name(name: &str) -> Option<MigrationSpec> {
    all().into_iter().find(|spec| spec.name == name)
}

/// Company document: provenance fields plus a display name.
///
/// The name comes from the first member carrying a non-blank
/// `company_name`, then the linking key, then the first member id.
fn company_fields(spec: &MigrationSpec, seed: TargetSeed<'_>) -> Map<String, Value> {
    let mut fields = default_target_fields(spec, seed);

    let name = seed
        .members
        .iter()
        .filter_map(|r| r.get_str("company_name"))
        .map(str::trim)
        .find(|n| !n.is_empty())
        .map(str::to_string)
        .or_else(|| seed.group_key.map(str::to_string))
        .or_else(|| seed.members.first().map(|r| r.id.clone()))
        .unwrap_or_default();

    fields.insert("name".into(), Value::String(name));
    fields
}
