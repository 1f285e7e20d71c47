//! Marketplace resource catalog.
//!
//! Names the cached resources, builds their fingerprints, and exposes typed
//! queries and mutations over the query client. Query parameters double as
//! the request's query string.

use folio_cache::{
    MutationEffects, MutationExecutor, QueryClient, QueryObserver, QueryOptions, SharedQueryFn,
};
use folio_core::{Fingerprint, FolioResult, Pattern};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::api_client::RestClient;

pub const BOOK: &str = "book";
pub const BOOK_DETAIL: &str = "book-detail";
pub const USER: &str = "user";
pub const USER_COUNTERS: &str = "user-counters";
pub const LISTING: &str = "listing";

/// Resources whose data belongs to the signed-in user. The configured
/// user-scoped list must include every one of them.
pub const USER_SCOPED: &[&str] = &[USER, USER_COUNTERS];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Book {
    pub id: u64,
    pub title: String,
    pub author: String,
    pub is_approved: bool,
    #[serde(default)]
    pub description: Option<String>,
}

/// Filter for the book list. Absent fields are left out of the fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_approved: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

impl BookFilter {
    pub fn approved(is_approved: bool) -> Self {
        Self {
            is_approved: Some(is_approved),
            ..Self::default()
        }
    }

    pub fn by_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub address: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserCounters {
    pub books_owned: u64,
    pub listings: u64,
    pub sales: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub id: u64,
    pub book_id: u64,
    pub seller: String,
    pub price: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateListing {
    pub book_id: u64,
    pub price: String,
}

pub fn books_key(filter: &BookFilter) -> FolioResult<Fingerprint> {
    Ok(Fingerprint::from_serialize(BOOK, filter)?)
}

pub fn book_key(id: u64) -> FolioResult<Fingerprint> {
    Ok(Fingerprint::builder(BOOK_DETAIL).param("id", id).build()?)
}

pub fn current_user_key() -> FolioResult<Fingerprint> {
    Ok(Fingerprint::bare(USER)?)
}

pub fn user_counters_key() -> FolioResult<Fingerprint> {
    Ok(Fingerprint::bare(USER_COUNTERS)?)
}

pub fn listings_key(book_id: u64) -> FolioResult<Fingerprint> {
    Ok(Fingerprint::builder(LISTING).param("bookId", book_id).build()?)
}

/// Typed access to the marketplace resources.
///
/// User-scoped queries return `None` while the resources are gated, which the
/// session binding does whenever no session is authenticated.
#[derive(Clone)]
pub struct Marketplace {
    client: QueryClient,
    rest: RestClient,
    mutations: MutationExecutor,
}

impl Marketplace {
    pub fn new(client: QueryClient, rest: RestClient) -> Self {
        let mutations = MutationExecutor::new(client.clone());
        Self {
            client,
            rest,
            mutations,
        }
    }

    pub fn client(&self) -> &QueryClient {
        &self.client
    }

    /// Fetch function for `path`, optionally sending the fingerprint's
    /// parameters as the query string.
    pub fn fetcher(&self, path: impl Into<String>, with_params: bool) -> SharedQueryFn {
        let rest = self.rest.clone();
        let path = path.into();
        Arc::new(move |fingerprint: Fingerprint| {
            let rest = rest.clone();
            let path = path.clone();
            async move {
                let params = with_params.then_some(&fingerprint);
                rest.get_value(&path, params).await
            }
        })
    }

    fn options(&self) -> QueryOptions {
        self.client.default_options()
    }

    pub async fn books(&self, filter: &BookFilter) -> FolioResult<Vec<Book>> {
        let fingerprint = books_key(filter)?;
        let books = self
            .client
            .query::<Vec<Book>>(&fingerprint, self.fetcher("/books", true), self.options())
            .await?;
        Ok(books.unwrap_or_default())
    }

    pub async fn watch_books(&self, filter: &BookFilter) -> FolioResult<QueryObserver> {
        let fingerprint = books_key(filter)?;
        Ok(self
            .client
            .watch(&fingerprint, self.fetcher("/books", true), self.options())
            .await)
    }

    pub async fn book(&self, id: u64) -> FolioResult<Option<Book>> {
        let fingerprint = book_key(id)?;
        let fetcher = self.fetcher(format!("/books/{}", id), false);
        self.client.query(&fingerprint, fetcher, self.options()).await
    }

    pub async fn current_user(&self) -> FolioResult<Option<UserProfile>> {
        let fingerprint = current_user_key()?;
        let fetcher = self.fetcher("/users/me", false);
        self.client.query(&fingerprint, fetcher, self.options()).await
    }

    pub async fn watch_current_user(&self) -> FolioResult<QueryObserver> {
        let fingerprint = current_user_key()?;
        let fetcher = self.fetcher("/users/me", false);
        Ok(self.client.watch(&fingerprint, fetcher, self.options()).await)
    }

    pub async fn user_counters(&self) -> FolioResult<Option<UserCounters>> {
        let fingerprint = user_counters_key()?;
        let fetcher = self.fetcher("/users/me/counters", false);
        self.client.query(&fingerprint, fetcher, self.options()).await
    }

    pub async fn listings(&self, book_id: u64) -> FolioResult<Vec<Listing>> {
        let fingerprint = listings_key(book_id)?;
        let fetcher = self.fetcher(format!("/books/{}/listings", book_id), false);
        let listings = self
            .client
            .query::<Vec<Listing>>(&fingerprint, fetcher, self.options())
            .await?;
        Ok(listings.unwrap_or_default())
    }

    /// Approve a book. Every book list and detail is refetched if observed.
    pub async fn approve_book(&self, id: u64) -> FolioResult<Book> {
        let path = format!("/books/{}/approve", id);
        let effects = MutationEffects::new()
            .invalidates(Pattern::resource(BOOK))
            .invalidates(Pattern::resource(BOOK_DETAIL))
            .success_message("Book approved");
        self.mutations
            .run(self.rest.post_json::<Book, _>(&path, &json!({})), effects)
            .await
    }

    /// Update the signed-in user's profile and store the returned profile.
    pub async fn update_profile(&self, patch: &ProfilePatch) -> FolioResult<UserProfile> {
        let effects = MutationEffects::new()
            .update(current_user_key()?, |profile: &UserProfile| profile.clone())
            .invalidates(Pattern::resource(USER_COUNTERS))
            .success_message("Profile updated");
        self.mutations
            .run(self.rest.patch_json::<UserProfile, _>("/users/me", patch), effects)
            .await
    }

    pub async fn create_listing(&self, request: &CreateListing) -> FolioResult<Listing> {
        let effects = MutationEffects::new()
            .invalidates(Pattern::resource(LISTING))
            .invalidates(Pattern::resource(USER_COUNTERS))
            .success_message("Listing created");
        self.mutations
            .run(self.rest.post_json::<Listing, _>("/listings", request), effects)
            .await
    }
}
