use chrono::{Months, NaiveDate};

const DATE_PARAM_FORMAT: &str = "%Y%m%d";

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("Invalid article parameter")]
    EmptyArticle,

    #[error("Invalid article parameter, {0:?} is not an article title")]
    DotSegment(String),

    #[error("Invalid month parameter, expected 1-12, got {0}")]
    MonthOutOfRange(u32),

    #[error("Invalid year parameter, expected 1-9999, got {0}")]
    YearOutOfRange(i32),
}

/// One article and calendar month to look up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleViewQuery {
    article: String,
    year: i32,
    month: u32,
    range: DateRange,
}

impl ArticleViewQuery {
    pub fn new(article: impl Into<String>, year: i32, month: u32) -> Result<Self, QueryError> {
        let article = article.into();
        if article.is_empty() {
            return Err(QueryError::EmptyArticle);
        }
        // url path normalisation would drop these instead of sending them upstream
        if article == "." || article == ".." {
            return Err(QueryError::DotSegment(article));
        }
        if !(1..=12).contains(&month) {
            return Err(QueryError::MonthOutOfRange(month));
        }
        // keeps both dates at exactly 8 digits
        if !(1..=9999).contains(&year) {
            return Err(QueryError::YearOutOfRange(year));
        }

        let range = month_range(year, month).ok_or(QueryError::YearOutOfRange(year))?;

        Ok(ArticleViewQuery {
            article,
            year,
            month,
            range,
        })
    }

    pub fn article(&self) -> &str {
        self.article.as_ref()
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// First and last day of the queried month.
    pub fn date_range(&self) -> DateRange {
        self.range
    }
}

fn month_range(year: i32, month: u32) -> Option<DateRange> {
    let start = NaiveDate::from_ymd_opt(year, month, 1)?;
    let end = start.checked_add_months(Months::new(1))?.pred_opt()?;

    Some(DateRange { start, end })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn start_param(&self) -> String {
        self.start.format(DATE_PARAM_FORMAT).to_string()
    }

    pub fn end_param(&self) -> String {
        self.end.format(DATE_PARAM_FORMAT).to_string()
    }
}
