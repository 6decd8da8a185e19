/// The page number of an empty [`PagedResult`], and the page requested by load/reload.
pub const FIRST_PAGE: usize = 1;

/// Paging metadata plus the accumulated items of a paginated list.
///
/// Values are never partially mutated by the orchestrators, every accepted update
/// replaces the whole snapshot.
///
/// Equality only considers [`PagedResult::page`] and [`PagedResult::items`],
/// the remaining fields are server-reported metadata.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PagedResult<T> {
    /// The current page number, starting at [`FIRST_PAGE`].
    pub page: usize,
    /// The rows, in display order.
    pub items: Vec<T>,
    /// `true` unless a fetch explicitly reported the end of the data.
    pub has_more_pages: bool,
    /// The total number of items across all pages.
    pub total_items: usize,
    /// The number of items per page.
    pub items_per_page: usize,
    /// The total number of pages.
    pub total_pages: usize,
}

impl<T> Default for PagedResult<T> {
    fn default() -> Self {
        Self {
            page: FIRST_PAGE,
            items: vec![],
            has_more_pages: true,
            total_items: 0,
            items_per_page: 0,
            total_pages: 0,
        }
    }
}

impl<T: PartialEq> PartialEq for PagedResult<T> {
    fn eq(&self, other: &Self) -> bool {
        self.page == other.page && self.items == other.items
    }
}

impl<T: Eq> Eq for PagedResult<T> {}

impl<T> PagedResult<T> {
    /// A page with the given items, all metadata at its defaults.
    pub fn new(page: usize, items: Vec<T>) -> Self {
        Self {
            page,
            items,
            ..Default::default()
        }
    }

    /// The empty first page.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The first page holding `items`.
    pub fn with_items(items: Vec<T>) -> Self {
        Self::new(FIRST_PAGE, items)
    }

    /// Set whether more pages exist after this one.
    pub fn set_has_more_pages(mut self, has_more_pages: bool) -> Self {
        self.has_more_pages = has_more_pages;
        self
    }

    /// Set the server-reported total number of items.
    pub fn set_total_items(mut self, total_items: usize) -> Self {
        self.total_items = total_items;
        self
    }

    /// Set the server-reported page size.
    pub fn set_items_per_page(mut self, items_per_page: usize) -> Self {
        self.items_per_page = items_per_page;
        self
    }

    /// Set the server-reported total number of pages.
    pub fn set_total_pages(mut self, total_pages: usize) -> Self {
        self.total_pages = total_pages;
        self
    }

    /// The number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether there are no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// A load-more response with nothing in it that also claims the data has ended.
    ///
    /// These are ignored rather than merged.
    pub fn is_empty_tail(&self) -> bool {
        self.items.is_empty() && !self.has_more_pages
    }

    /// Map every item, keeping the metadata.
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> PagedResult<U> {
        PagedResult {
            page: self.page,
            items: self.items.into_iter().map(f).collect(),
            has_more_pages: self.has_more_pages,
            total_items: self.total_items,
            items_per_page: self.items_per_page,
            total_pages: self.total_pages,
        }
    }

    /// Append a following page: items are concatenated in order, every other field is taken from `next`.
    pub fn append(self, next: PagedResult<T>) -> PagedResult<T> {
        let PagedResult {
            page,
            items: next_items,
            has_more_pages,
            total_items,
            items_per_page,
            total_pages,
        } = next;
        let mut items = self.items;
        items.extend(next_items);
        PagedResult {
            page,
            items,
            has_more_pages,
            total_items,
            items_per_page,
            total_pages,
        }
    }
}
