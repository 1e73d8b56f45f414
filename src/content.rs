use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use lazy_static::lazy_static;
use rand::seq::IndexedRandom;
use rand::Rng;
use regex::{Regex, RegexBuilder};
use reqwest::Url;
use scraper::{CaseSensitivity, ElementRef, Html, Selector};
use thiserror::Error;

const SVALKO: &str = "https://svalko.org";
const BANEKS_RANDOM: &str = "http://baneks.ru/random";
const MAX_COMMENT_LEN: usize = 500;
const MAX_CAPTION_LEN: usize = 200;
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to retrieve website: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("invalid website content: {0}")]
    ParseError(Cow<'static, str>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Post {
    Photo { image: Vec<u8>, caption: String },
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaggedPost {
    Found(Post),
    UnknownTag,
}

/// Source of content. Each call is a single attempt.
pub trait ContentProvider: Send + Sync + 'static {
    fn random_comment(&self) -> BoxFuture<'_, Result<String, Error>>;
    fn random_joke(&self) -> BoxFuture<'_, Result<String, Error>>;
    fn random_picture(&self) -> BoxFuture<'_, Result<Vec<u8>, Error>>;
    fn tagged_post<'a>(&'a self, tag: &'a str) -> BoxFuture<'a, Result<TaggedPost, Error>>;
}

/// Retrying front of a [`ContentProvider`]. `None` means nothing could be
/// fetched within the attempt limit.
#[derive(Clone)]
pub struct Content {
    provider: Arc<dyn ContentProvider>,
    attempts: u32,
}

impl Content {
    pub fn new(provider: Arc<dyn ContentProvider>, attempts: u32) -> Self {
        Self { provider, attempts }
    }

    async fn retry<'a, T>(
        &'a self,
        what: &str,
        fetch: impl Fn() -> BoxFuture<'a, Result<T, Error>>,
    ) -> Option<T> {
        for attempt in 1..=self.attempts {
            match fetch().await {
                Ok(value) => return Some(value),
                Err(e) => {
                    log::warn!("Fetching {what} failed ({attempt}/{}): {e}", self.attempts);
                    if attempt < self.attempts {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }
        None
    }

    pub async fn comment(&self) -> Option<String> {
        self.retry("comment", || self.provider.random_comment()).await
    }

    pub async fn joke(&self) -> Option<String> {
        self.retry("joke", || self.provider.random_joke()).await
    }

    pub async fn picture(&self) -> Option<Vec<u8>> {
        self.retry("picture", || self.provider.random_picture()).await
    }

    pub async fn tagged_post(&self, tag: &str) -> Option<TaggedPost> {
        self.retry("tagged post", || self.provider.tagged_post(tag)).await
    }
}

fn extract_text(e: &ElementRef) -> String {
    e.text().collect::<Vec<_>>().concat().trim().to_owned()
}

fn is_tags_block(e: ElementRef) -> bool {
    e.value().name() == "div" && e.value().has_class("tags", CaseSensitivity::CaseSensitive)
}

/// Text of a post without its tag list.
fn post_text(post: ElementRef) -> String {
    let mut text = String::new();
    for node in post.descendants() {
        let Some(chunk) = node.value().as_text() else {
            continue;
        };
        let in_tags = node
            .ancestors()
            .take_while(|a| a.id() != post.id())
            .filter_map(ElementRef::wrap)
            .any(is_tags_block);
        if !in_tags {
            text.push_str(chunk);
        }
    }
    text.trim().to_owned()
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

fn parse_document(html: &str) -> Html {
    let document = Html::parse_document(html);
    for error in &document.errors {
        log::debug!("Parser error: {error}");
    }
    document
}

lazy_static! {
    static ref COMMENT_SELECTOR: Selector = Selector::parse("div.comment").unwrap();
    static ref TEXT_SELECTOR: Selector = Selector::parse("div.text").unwrap();
    static ref JOKE_SELECTOR: Selector = Selector::parse("section.anek-view p").unwrap();
    static ref LINK_SELECTOR: Selector = Selector::parse("a[href]").unwrap();
    static ref TAG_LINK_SELECTOR: Selector = Selector::parse(r#"a[href^="/tag/"]"#).unwrap();
    static ref PAGING_SELECTOR: Selector = Selector::parse("div.paging b").unwrap();
    static ref POSTING_TEXT_SELECTOR: Selector = Selector::parse("div.posting div.text").unwrap();
    static ref IMG_SELECTOR: Selector = Selector::parse("img[src]").unwrap();
    static ref IMAGE_VIEW_REGEX: Regex =
        Regex::new(r"^javascript: image_view\('svalko\.org', '(.*?)', \d+, \d+\);$").unwrap();
}

fn parse_comments(html: &str) -> Vec<String> {
    let document = parse_document(html);
    let comments = document
        .select(&COMMENT_SELECTOR)
        .filter(|c| {
            let text = extract_text(c);
            !text.is_empty() && text.chars().count() < MAX_COMMENT_LEN
        })
        .filter_map(|c| c.select(&TEXT_SELECTOR).next())
        .map(|t| extract_text(&t))
        .collect();
    comments
}

fn parse_joke(html: &str) -> Result<String, Error> {
    let document = parse_document(html);
    let joke = document
        .select(&JOKE_SELECTOR)
        .next()
        .map(|p| extract_text(&p));
    joke.ok_or(Error::ParseError("joke not on site".into()))
}

fn parse_image_names(html: &str) -> Vec<String> {
    let document = parse_document(html);
    let names = document
        .select(&LINK_SELECTOR)
        .filter_map(|a| {
            let href = a.value().attr("href")?;
            Some(IMAGE_VIEW_REGEX.captures(href)?.get(1)?.as_str().to_owned())
        })
        .collect();
    names
}

/// Href of the first tag whose name contains `query`, ignoring case.
fn find_tag(html: &str, query: &str) -> Result<Option<String>, Error> {
    let pattern = RegexBuilder::new(&regex::escape(query))
        .case_insensitive(true)
        .build()
        .map_err(|e| Error::ParseError(e.to_string().into()))?;

    let document = parse_document(html);
    let href = document
        .select(&TAG_LINK_SELECTOR)
        .find(|a| pattern.is_match(&extract_text(a)))
        .and_then(|a| a.value().attr("href"))
        .map(str::to_owned);
    Ok(href)
}

fn parse_page_count(html: &str) -> Result<u32, Error> {
    let document = parse_document(html);
    let paging = document
        .select(&PAGING_SELECTOR)
        .next()
        .ok_or(Error::ParseError("paging not on site".into()))?;
    let text = extract_text(&paging);
    text.trim_matches(|c| c == '[' || c == ']')
        .parse()
        .map_err(|_| Error::ParseError(format!("invalid page count {text:?}").into()))
}

enum RawPost {
    Image { src: String, caption: String },
    Text(String),
}

fn pick_post(html: &str) -> Result<RawPost, Error> {
    let document = parse_document(html);
    let posts: Vec<_> = document.select(&POSTING_TEXT_SELECTOR).collect();
    let post = posts
        .choose(&mut rand::rng())
        .ok_or(Error::ParseError("no posts on page".into()))?;

    let text = post_text(*post);
    let src = post
        .select(&IMG_SELECTOR)
        .next()
        .and_then(|img| img.value().attr("src"))
        .map(str::to_owned);

    let raw = match src {
        Some(src) => RawPost::Image {
            src,
            caption: truncate(&text, MAX_CAPTION_LEN),
        },
        None => RawPost::Text(text),
    };
    Ok(raw)
}

/// Scrapes svalko.org for comments and pictures and baneks.ru for jokes.
pub struct Svalko {
    client: reqwest::Client,
    base: Url,
}

impl Svalko {
    pub fn new() -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        let base = Url::parse(SVALKO).map_err(|e| Error::ParseError(e.to_string().into()))?;
        Ok(Self { client, base })
    }

    fn url(&self, path: &str) -> Result<Url, Error> {
        self.base
            .join(path)
            .map_err(|e| Error::ParseError(format!("invalid url {path:?}: {e}").into()))
    }

    async fn get_text(&self, url: Url) -> Result<String, Error> {
        log::debug!("Get site {url}");
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.text().await?)
    }

    async fn get_bytes(&self, url: Url) -> Result<Vec<u8>, Error> {
        log::debug!("Get file {url}");
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn fetch_comment(&self) -> Result<String, Error> {
        let html = self.get_text(self.url("/random.html")?).await?;
        parse_comments(&html)
            .choose(&mut rand::rng())
            .cloned()
            .ok_or(Error::ParseError("no comments on page".into()))
    }

    async fn fetch_joke(&self) -> Result<String, Error> {
        let url = Url::parse(BANEKS_RANDOM).map_err(|e| Error::ParseError(e.to_string().into()))?;
        let html = self.get_text(url).await?;
        parse_joke(&html)
    }

    async fn fetch_picture(&self) -> Result<Vec<u8>, Error> {
        let nonce: u32 = rand::rng().random_range(0..100_000_000);
        let html = self
            .get_text(self.url(&format!("/images.html?rand={nonce}"))?)
            .await?;
        let name = parse_image_names(&html)
            .choose(&mut rand::rng())
            .cloned()
            .ok_or(Error::ParseError("no images on page".into()))?;
        self.get_bytes(self.url(&format!("/data/{name}"))?).await
    }

    async fn fetch_tagged_post(&self, tag: &str) -> Result<TaggedPost, Error> {
        let html = self.get_text(self.url("/tags.html")?).await?;
        let Some(href) = find_tag(&html, tag)? else {
            return Ok(TaggedPost::UnknownTag);
        };
        let tag_id = href.trim_start_matches("/tag/").to_owned();

        let html = self.get_text(self.url(&href)?).await?;
        let pages = parse_page_count(&html)?;
        let page = rand::rng().random_range(0..=pages);

        let html = self
            .get_text(self.url(&format!("/page/{page}?tag_id={tag_id}"))?)
            .await?;
        let post = match pick_post(&html)? {
            RawPost::Image { src, caption } => Post::Photo {
                image: self.get_bytes(self.url(&src)?).await?,
                caption,
            },
            RawPost::Text(text) => Post::Text(text),
        };
        Ok(TaggedPost::Found(post))
    }
}

impl ContentProvider for Svalko {
    fn random_comment(&self) -> BoxFuture<'_, Result<String, Error>> {
        Box::pin(self.fetch_comment())
    }

    fn random_joke(&self) -> BoxFuture<'_, Result<String, Error>> {
        Box::pin(self.fetch_joke())
    }

    fn random_picture(&self) -> BoxFuture<'_, Result<Vec<u8>, Error>> {
        Box::pin(self.fetch_picture())
    }

    fn tagged_post<'a>(&'a self, tag: &'a str) -> BoxFuture<'a, Result<TaggedPost, Error>> {
        Box::pin(self.fetch_tagged_post(tag))
    }
}
