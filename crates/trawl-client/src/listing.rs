use scraper::{ElementRef, Html, Selector};
use trawl_core::error::AppError;
use trawl_core::models::Fetched;
use trawl_core::traits::{ListingItem, ListingPage, ListingSource};
use trawl_core::util::{append_query_param, url_reflects_page};
use url::Url;

/// How page `n` of a listing is addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pagination {
    /// `{start}?{param}={n}`
    Query(String),
    /// `{start}/{segment}/{n}`
    PathSegment(String),
}

/// Listing parser driven by CSS selectors.
///
/// Every element matching the item selector becomes one [`ListingItem`]. Its
/// link is the element's own `href` or the first `a[href]` inside it, made
/// absolute against the page's final URL; its title is the text of the title
/// selector when set, the element's text otherwise.
#[derive(Debug, Clone)]
pub struct SelectorListing {
    item: Selector,
    title: Option<Selector>,
    link: Selector,
    page_title: Selector,
    pagination: Pagination,
    not_found_markers: Vec<String>,
}

fn parse_selector(css: &str) -> Result<Selector, AppError> {
    Selector::parse(css).map_err(|e| AppError::ConfigError(format!("invalid selector '{css}': {e}")))
}

impl SelectorListing {
    pub fn new(item_selector: &str) -> Result<Self, AppError> {
        Ok(Self {
            item: parse_selector(item_selector)?,
            title: None,
            link: parse_selector("a[href]")?,
            page_title: parse_selector("title")?,
            pagination: Pagination::Query("page".to_string()),
            not_found_markers: vec!["page not found".to_string()],
        })
    }

    pub fn with_title_selector(mut self, css: &str) -> Result<Self, AppError> {
        self.title = Some(parse_selector(css)?);
        Ok(self)
    }

    pub fn with_pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = pagination;
        self
    }

    /// Case-insensitive text that marks the page `<title>` as "not found".
    pub fn with_not_found_marker(mut self, marker: impl Into<String>) -> Self {
        self.not_found_markers.push(marker.into().to_lowercase());
        self
    }

    fn item(&self, element: ElementRef<'_>, base: Option<&Url>) -> Option<ListingItem> {
        let href = match element.value().attr("href") {
            Some(href) => href,
            None => element.select(&self.link).next()?.value().attr("href")?,
        };
        let url = match base {
            Some(base) => base.join(href).ok()?.to_string(),
            None => href.to_string(),
        };

        let title_text = match &self.title {
            Some(selector) => element.select(selector).next()?.text().collect::<String>(),
            None => element.text().collect::<String>(),
        };
        let title = title_text.split_whitespace().collect::<Vec<_>>().join(" ");
        if title.is_empty() {
            return None;
        }
        Some(ListingItem::new(title, url))
    }
}

impl ListingSource for SelectorListing {
    fn page_url(&self, start_url: &str, page: u32) -> String {
        if page <= 1 {
            return start_url.to_string();
        }
        match &self.pagination {
            Pagination::Query(param) => append_query_param(start_url, param, &page.to_string()),
            Pagination::PathSegment(segment) => {
                format!("{}/{segment}/{page}", start_url.trim_end_matches('/'))
            }
        }
    }

    fn parse_page(&self, fetched: &Fetched) -> ListingPage {
        let document = Html::parse_document(&fetched.body);

        let not_found = document.select(&self.page_title).next().is_some_and(|title| {
            let text = title.text().collect::<String>().to_lowercase();
            self.not_found_markers.iter().any(|marker| text.contains(marker))
        });
        if not_found {
            return ListingPage {
                items: Vec::new(),
                not_found: true,
            };
        }

        let base = Url::parse(&fetched.final_url).ok();
        let items = document
            .select(&self.item)
            .filter_map(|element| self.item(element, base.as_ref()))
            .collect();
        ListingPage {
            items,
            not_found: false,
        }
    }

    fn reflects_page(&self, final_url: &str, page: u32) -> bool {
        let param = match &self.pagination {
            Pagination::Query(param) | Pagination::PathSegment(param) => param,
        };
        url_reflects_page(final_url, param, page)
    }
}
