//! Deterministic fake-value generation. Every faker is seeded from the
//! original column value's hash, so the same input always produces the same
//! fake output — replaying a capture stream twice against the same rows
//! never drifts.

use fnv::FnvHasher;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hash::Hasher;

use kasho_model::ColumnValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakerKind {
    Name,
    FirstName,
    LastName,
    Email,
    Ssn,
    Address,
    Company,
    Product,
    Paragraph,
    Month,
    Year,
    CreditCard,
    Currency,
}

impl FakerKind {
    pub fn parse(tag: &str) -> Option<Self> {
        Some(match tag {
            "FakeName" => FakerKind::Name,
            "FakeFirstName" => FakerKind::FirstName,
            "FakeLastName" => FakerKind::LastName,
            "FakeEmail" => FakerKind::Email,
            "FakeSSN" => FakerKind::Ssn,
            "FakeAddress" => FakerKind::Address,
            "FakeCompany" => FakerKind::Company,
            "FakeProduct" => FakerKind::Product,
            "FakeParagraph" => FakerKind::Paragraph,
            "FakeMonth" => FakerKind::Month,
            "FakeYear" => FakerKind::Year,
            "FakeCreditCard" => FakerKind::CreditCard,
            "FakeCurrency" => FakerKind::Currency,
            _ => return None,
        })
    }
}

const FIRST_NAMES: &[&str] = &[
    "Alice", "Bob", "Carol", "David", "Eve", "Frank", "Grace", "Heidi", "Ivan", "Judy", "Mallory",
    "Niaj", "Olivia", "Peggy", "Quentin", "Rupert", "Sybil", "Trent", "Uma", "Victor",
];
const LAST_NAMES: &[&str] = &[
    "Anderson", "Brown", "Clark", "Doe", "Evans", "Foster", "Garcia", "Harris", "Ibrahim", "Jones",
    "Kim", "Lopez", "Martin", "Nguyen", "O'Connor", "Patel", "Quinn", "Reyes", "Smith", "Turner",
];
const COMPANIES: &[&str] = &[
    "Acme Corp", "Globex", "Initech", "Umbrella LLC", "Stark Industries", "Wayne Enterprises",
    "Soylent Corp", "Hooli", "Vandelay Industries", "Cyberdyne Systems",
];
const PRODUCTS: &[&str] = &[
    "Widget", "Gadget", "Gizmo", "Doohickey", "Contraption", "Thingamajig", "Sprocket", "Cog",
];
const STREETS: &[&str] = &[
    "Maple St", "Oak Ave", "Pine Rd", "Cedar Blvd", "Elm Dr", "Birch Ln", "Spruce Ct", "Willow Way",
];
const WORDS: &[&str] = &[
    "consequat", "tempor", "dolore", "labore", "magna", "aliqua", "enim", "minim", "veniam",
    "quis", "nostrud", "exercitation", "ullamco", "laboris", "nisi",
];
const MONTHS: &[&str] = &[
    "January", "February", "March", "April", "May", "June", "July", "August", "September",
    "October", "November", "December",
];
const CURRENCIES: &[&str] = &["USD", "EUR", "GBP", "JPY", "CAD", "AUD", "CHF", "CNY"];

/// Hashes `value`'s canonical text form with FNV-1a and seeds a `StdRng`
/// from it. Two evaluations of the same value always produce the same
/// sequence of draws from the returned generator.
pub fn seeded_rng(value: &ColumnValue) -> StdRng {
    let text = canonical_text(value);
    let mut hasher = FnvHasher::default();
    hasher.write(text.as_bytes());
    StdRng::seed_from_u64(hasher.finish())
}

fn canonical_text(value: &ColumnValue) -> String {
    match value {
        ColumnValue::Null => String::new(),
        ColumnValue::String(s) | ColumnValue::Timestamp(s) => s.clone(),
        ColumnValue::Int64(i) => i.to_string(),
        ColumnValue::Float64(f) => f.to_string(),
        ColumnValue::Bool(b) => b.to_string(),
    }
}

/// The low bit of the original value's hash, used for `BoolFlip`.
pub fn low_bit(value: &ColumnValue) -> bool {
    let text = canonical_text(value);
    let mut hasher = FnvHasher::default();
    hasher.write(text.as_bytes());
    hasher.finish() & 1 == 1
}

fn pick<'a>(rng: &mut StdRng, pool: &'a [&'a str]) -> &'a str {
    pool[rng.gen_range(0..pool.len())]
}

pub fn generate(kind: FakerKind, rng: &mut StdRng) -> ColumnValue {
    match kind {
        FakerKind::Name => ColumnValue::String(format!("{} {}", pick(rng, FIRST_NAMES), pick(rng, LAST_NAMES))),
        FakerKind::FirstName => ColumnValue::String(pick(rng, FIRST_NAMES).to_string()),
        FakerKind::LastName => ColumnValue::String(pick(rng, LAST_NAMES).to_string()),
        FakerKind::Email => ColumnValue::String(format!(
            "{}.{}@example.com",
            pick(rng, FIRST_NAMES).to_lowercase(),
            pick(rng, LAST_NAMES).to_lowercase()
        )),
        FakerKind::Ssn => ColumnValue::String(format!(
            "{:03}-{:02}-{:04}",
            rng.gen_range(0..1000),
            rng.gen_range(0..100),
            rng.gen_range(0..10000)
        )),
        FakerKind::Address => ColumnValue::String(format!("{} {}", rng.gen_range(1..9999), pick(rng, STREETS))),
        FakerKind::Company => ColumnValue::String(pick(rng, COMPANIES).to_string()),
        FakerKind::Product => ColumnValue::String(pick(rng, PRODUCTS).to_string()),
        FakerKind::Paragraph => {
            let len = rng.gen_range(6..12);
            let words: Vec<&str> = (0..len).map(|_| pick(rng, WORDS)).collect();
            let mut text = words.join(" ");
            text.push('.');
            ColumnValue::String(text)
        }
        FakerKind::Month => ColumnValue::String(pick(rng, MONTHS).to_string()),
        FakerKind::Year => ColumnValue::Int64(rng.gen_range(1970..2035)),
        FakerKind::CreditCard => {
            let groups: Vec<String> = (0..4).map(|_| format!("{:04}", rng.gen_range(0..10000))).collect();
            ColumnValue::String(groups.join(" "))
        }
        FakerKind::Currency => ColumnValue::String(pick(rng, CURRENCIES).to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_input_produces_same_fake_value() {
        let original = ColumnValue::String("row-42".to_string());
        let mut rng1 = seeded_rng(&original);
        let mut rng2 = seeded_rng(&original);
        assert_eq!(generate(FakerKind::FirstName, &mut rng1), generate(FakerKind::FirstName, &mut rng2));
    }

    #[test]
    fn different_input_usually_produces_different_fake_value() {
        let a = ColumnValue::String("row-1".to_string());
        let b = ColumnValue::String("row-2".to_string());
        let mut rng_a = seeded_rng(&a);
        let mut rng_b = seeded_rng(&b);
        assert_ne!(generate(FakerKind::Email, &mut rng_a), generate(FakerKind::Email, &mut rng_b));
    }

    #[test]
    fn low_bit_is_deterministic() {
        let value = ColumnValue::Bool(true);
        assert_eq!(low_bit(&value), low_bit(&value));
    }

    #[test]
    fn parse_rejects_unknown_tag() {
        assert!(FakerKind::parse("FakeBitcoinAddress").is_none());
    }
}
