//! Page-number pagination shared by every list query
//!
//! Pages are 1-based on the wire and 0-based internally. Every list query
//! follows the same steps:
//!
//! 1. count the rows matching the filter (`total_entries`)
//! 2. derive `page_amount = ceil(total_entries / PAGE_SIZE)`
//! 3. reject an out-of-range page unless a search filter is active
//! 4. resolve `order_by` (`field` or `-field`) against a per-entity allow-list
//!
//! # Example
//!
//! ```
//! use recommdo_core::pagination::{page_amount, PageWindow, PAGE_SIZE};
//!
//! assert_eq!(page_amount(23), 3);
//!
//! let window = PageWindow::resolve(2, 23, false).unwrap();
//! assert_eq!(window.offset, PAGE_SIZE);
//! assert!(PageWindow::resolve(4, 23, false).is_err());
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of rows in every page
pub const PAGE_SIZE: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Page {requested} is out of range (page amount: {page_amount})")]
pub struct PageOutOfRange {
    pub requested: i64,
    pub page_amount: u64,
}

/// `ceil(total_entries / PAGE_SIZE)`
pub fn page_amount(total_entries: u64) -> u64 {
    total_entries.div_ceil(PAGE_SIZE)
}

/// The slice of rows selected by a page request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    /// 0-based page index
    pub index: u64,
    pub offset: u64,
    pub limit: u64,
    pub page_amount: u64,
}

impl PageWindow {
    /// Resolve a 1-based page number against the number of matching rows.
    ///
    /// Page numbers below 1 are coerced to the first page. The first page of
    /// an empty result is always in range. When `searching` is set an
    /// out-of-range page yields an empty window instead of an error.
    pub fn resolve(
        page: i64,
        total_entries: u64,
        searching: bool,
    ) -> Result<Self, PageOutOfRange> {
        let index = page.saturating_sub(1).max(0) as u64;
        let page_amount = page_amount(total_entries);

        if index > 0 && index >= page_amount && !searching {
            return Err(PageOutOfRange {
                requested: page,
                page_amount,
            });
        }

        Ok(Self {
            index,
            // Pages past the end all read from the end of the result
            offset: index.min(page_amount) * PAGE_SIZE,
            limit: PAGE_SIZE,
            page_amount,
        })
    }
}

/// One page of results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    /// 1-based page number that was served
    pub current_page: u64,
    pub page_amount: u64,
    pub shown_entries: u64,
    pub total_entries: u64,
    pub items: Vec<T>,
}

impl<T> Page<T> {
    pub fn new(window: PageWindow, total_entries: u64, items: Vec<T>) -> Self {
        Self {
            current_page: window.index + 1,
            page_amount: window.page_amount,
            shown_entries: items.len() as u64,
            total_entries,
            items,
        }
    }

    /// An empty first page, used when a filter can never match
    pub fn empty() -> Self {
        Self {
            current_page: 1,
            page_amount: 0,
            shown_entries: 0,
            total_entries: 0,
            items: Vec::new(),
        }
    }
}

/// A column that list queries may be ordered by
///
/// `Default` is the fallback used for unrecognized field names.
pub trait SortField: Copy + Default {
    /// Resolve a field name from the allow-list
    fn parse(name: &str) -> Option<Self>;
}

/// Requested ordering: a field and a direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortOrder<F> {
    pub field: F,
    pub descending: bool,
}

impl<F: SortField> Default for SortOrder<F> {
    fn default() -> Self {
        Self {
            field: F::default(),
            descending: false,
        }
    }
}

impl<F: SortField> SortOrder<F> {
    /// Parse `field` / `-field`. Unknown fields silently fall back to the
    /// default ascending order.
    pub fn parse(order_by: Option<&str>) -> Self {
        let Some(raw) = order_by.map(str::trim).filter(|s| !s.is_empty()) else {
            return Self::default();
        };

        let (descending, name) = match raw.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };

        match F::parse(name) {
            Some(field) => Self { field, descending },
            None => Self::default(),
        }
    }
}

/// Numeric search over identifier columns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchFilter {
    /// No search requested
    None,
    /// Match rows whose user id or item id equals the value
    Id(i64),
    /// A search that can never match (non-numeric or fractional input)
    Unmatchable,
}

impl SearchFilter {
    /// Interpret the raw search input. Anything that is not an integral
    /// number produces [`SearchFilter::Unmatchable`], never an error.
    pub fn parse(search: Option<&str>) -> Self {
        let Some(raw) = search.map(str::trim) else {
            return SearchFilter::None;
        };

        if let Ok(id) = raw.parse::<i64>() {
            return SearchFilter::Id(id);
        }

        match raw.parse::<f64>() {
            Ok(value) if value.is_finite() && value.fract() == 0.0 => {
                SearchFilter::Id(value as i64)
            }
            _ => SearchFilter::Unmatchable,
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, SearchFilter::None)
    }

    pub fn id(&self) -> Option<i64> {
        match self {
            SearchFilter::Id(id) => Some(*id),
            _ => None,
        }
    }
}
