//! # Records Module
//!
//! The listing records the extraction layer produces, and their projection onto store rows.
//!
//! ## Overview
//!
//! [`CrawlRecord`] is a closed sum over the three listing kinds. Every consumer (the
//! persistence pipelines, the fan-out encoder) matches on it exhaustively, so adding a
//! variant is a compile error until each consumer decides what to do with it.
//!
//! Fields are optional strings: extraction cleans them but never guarantees presence.
//! [`CrawlRecord::validate`] enforces the keys a row needs before anything is written.

use crate::error::CrawlError;
use crate::store::{ColumnFamily, Mutation};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};

/// Family holding descriptive listing fields.
pub const BASIC_FAMILY: &str = "basic";
/// Family holding dated price snapshots of secondhand listings.
pub const PRICE_FAMILY: &str = "price";
/// Price snapshots are kept for one year.
pub const PRICE_TTL_SECS: u64 = 365 * 24 * 60 * 60;

macro_rules! listing {
    ($(#[$meta:meta])* $name:ident { $($field:ident),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct $name {
            $(pub $field: Option<String>,)+
        }

        impl $name {
            /// Every field as `(qualifier, value)`, in declaration order.
            pub fn fields(&self) -> Vec<(&'static str, Option<&str>)> {
                vec![$((stringify!($field), self.$field.as_deref()),)+]
            }
        }
    };
}

listing!(
    /// A listing currently on sale.
    SecondhandHouse {
        city, title, room, b_year, comm, id, main, sub, space, tags, total, unit,
    }
);

listing!(
    /// A closed deal.
    SoldHouse {
        city, comm, info, deal, total, unit, hang, period, room, space, b_year, id, main, sub,
    }
);

listing!(
    /// A new development project.
    NewHouse {
        city, title, p_type, price, id, sub, dev, open, over, f_space, b_space, p_year,
    }
);

/// Qualifiers of the secondhand `basic` row.
const SECONDHAND_BASIC: [&str; 10] = [
    "city", "title", "room", "comm", "id", "main", "sub", "space", "tags", "b_year",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrawlRecord {
    Secondhand(SecondhandHouse),
    Sold(SoldHouse),
    NewHouse(NewHouse),
}

/// Which store table a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Secondhand,
    Sold,
    NewHouse,
}

impl RecordKind {
    pub fn name(self) -> &'static str {
        match self {
            RecordKind::Secondhand => "secondhand",
            RecordKind::Sold => "sold",
            RecordKind::NewHouse => "new house",
        }
    }

    /// Column families of this kind's table.
    pub fn families(self) -> Vec<ColumnFamily> {
        match self {
            RecordKind::Secondhand => vec![
                ColumnFamily::new(BASIC_FAMILY),
                ColumnFamily::new(PRICE_FAMILY).with_ttl(PRICE_TTL_SECS),
            ],
            RecordKind::Sold | RecordKind::NewHouse => vec![ColumnFamily::new(BASIC_FAMILY)],
        }
    }
}

/// The date a run stamps onto the rows it writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDate {
    created_at: String,
    reversed_day: u32,
}

impl RunDate {
    pub fn new(day: NaiveDate) -> Self {
        let created_at = day.format("%y%m%d").to_string();
        // yymmdd always parses and never exceeds 991231.
        let stamp: u32 = created_at.parse().unwrap_or(0);
        Self {
            created_at,
            reversed_day: 991_231 - stamp,
        }
    }

    pub fn today() -> Self {
        Self::new(Local::now().date_naive())
    }

    /// `yymmdd` of the run.
    pub fn created_at(&self) -> &str {
        &self.created_at
    }

    /// Sorts newer snapshots of the same listing first.
    pub fn reversed_day(&self) -> u32 {
        self.reversed_day
    }
}

/// One row write derived from a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowWrite {
    pub row: String,
    pub mutations: Vec<Mutation>,
}

fn present(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn put_present(mutations: &mut Vec<Mutation>, family: &str, qualifier: &str, value: Option<&str>) {
    if let Some(value) = value {
        mutations.push(Mutation::put(family, qualifier, value.as_bytes()));
    }
}

impl CrawlRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            CrawlRecord::Secondhand(_) => RecordKind::Secondhand,
            CrawlRecord::Sold(_) => RecordKind::Sold,
            CrawlRecord::NewHouse(_) => RecordKind::NewHouse,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            CrawlRecord::Secondhand(house) => house.id.as_deref(),
            CrawlRecord::Sold(house) => house.id.as_deref(),
            CrawlRecord::NewHouse(house) => house.id.as_deref(),
        }
    }

    fn malformed(&self, reason: impl Into<String>) -> CrawlError {
        CrawlError::MalformedRecord {
            variant: self.kind().name(),
            reason: reason.into(),
        }
    }

    /// Checks that the record carries the fields its rows are keyed on.
    ///
    /// Every kind needs an `id`; sold rows are also keyed on `deal`; new-house records
    /// are only accepted complete.
    pub fn validate(&self) -> Result<(), CrawlError> {
        if present(self.id()).is_none() {
            return Err(self.malformed("missing id"));
        }
        match self {
            CrawlRecord::Secondhand(_) => Ok(()),
            CrawlRecord::Sold(house) => match present(house.deal.as_deref()) {
                Some(_) => Ok(()),
                None => Err(self.malformed("missing deal")),
            },
            CrawlRecord::NewHouse(house) => {
                let missing: Vec<&str> = house
                    .fields()
                    .into_iter()
                    .filter(|(_, value)| value.is_none())
                    .map(|(name, _)| name)
                    .collect();
                if missing.is_empty() {
                    Ok(())
                } else {
                    Err(self.malformed(format!("missing {}", missing.join(", "))))
                }
            }
        }
    }

    /// Validates the record and projects it onto the rows to write.
    pub fn rows(&self, date: &RunDate) -> Result<Vec<RowWrite>, CrawlError> {
        self.validate()?;
        let id = self.id().unwrap_or_default();

        let rows = match self {
            CrawlRecord::Secondhand(house) => {
                let fields = house.fields();
                let mut basic = Vec::new();
                for qualifier in SECONDHAND_BASIC {
                    let value = fields
                        .iter()
                        .find(|(name, _)| *name == qualifier)
                        .and_then(|(_, value)| *value);
                    put_present(&mut basic, BASIC_FAMILY, qualifier, value);
                }

                let mut price = vec![Mutation::put(
                    PRICE_FAMILY,
                    "ctime",
                    date.created_at().as_bytes(),
                )];
                put_present(&mut price, PRICE_FAMILY, "total", house.total.as_deref());
                put_present(&mut price, PRICE_FAMILY, "unit", house.unit.as_deref());

                vec![
                    RowWrite {
                        row: id.to_string(),
                        mutations: basic,
                    },
                    RowWrite {
                        row: format!("{}-{}", id, date.reversed_day()),
                        mutations: price,
                    },
                ]
            }
            CrawlRecord::Sold(house) => {
                let mut basic = Vec::new();
                for (qualifier, value) in house.fields() {
                    put_present(&mut basic, BASIC_FAMILY, qualifier, value);
                }
                vec![RowWrite {
                    row: format!("{}-{}", id, house.deal.as_deref().unwrap_or_default()),
                    mutations: basic,
                }]
            }
            CrawlRecord::NewHouse(house) => {
                let mut basic = Vec::new();
                for (qualifier, value) in house.fields() {
                    put_present(&mut basic, BASIC_FAMILY, qualifier, value);
                }
                vec![RowWrite {
                    row: format!("{}-{}", id, date.reversed_day()),
                    mutations: basic,
                }]
            }
        };
        Ok(rows)
    }
}
