use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::models::Profile;

lazy_static! {
    static ref TITLE_SELECTOR: Selector = Selector::parse("title").expect("Invalid title selector");
    static ref PARAM_ITEM_SELECTOR: Selector =
        Selector::parse(".param-item").expect("Invalid param selector");
    static ref PARAM_HEADING_SELECTOR: Selector =
        Selector::parse("h5.text-bold").expect("Invalid heading selector");
    static ref PARAM_VALUE_SELECTOR: Selector =
        Selector::parse(".text-nowrap").expect("Invalid value selector");
    static ref RATING_SELECTOR: Selector =
        Selector::parse(".rating-value").expect("Invalid rating selector");
    static ref REVIEW_COUNT_SELECTOR: Selector =
        Selector::parse(".rating-full-count a").expect("Invalid review count selector");
    static ref LOT_SELECTOR: Selector =
        Selector::parse(r#"a[data-href*="/lots/offer?id="]"#).expect("Invalid lot selector");
    static ref DANGER_LABEL_SELECTOR: Selector =
        Selector::parse(".label.label-danger").expect("Invalid danger label selector");
    static ref SUCCESS_LABEL_SELECTOR: Selector =
        Selector::parse(".label.label-success").expect("Invalid success label selector");

    /// Page titles read "Пользователь <nickname> / FunPay".
    static ref NICKNAME_PATTERN: Regex =
        Regex::new(r"Пользователь (.*?) /").expect("Invalid nickname regex");
    static ref DECIMAL_PATTERN: Regex = Regex::new(r"\d+(?:[.,]\d+)?").expect("Invalid decimal regex");
}

const NOT_FOUND_MARKERS: [&str; 2] = ["Ошибка 404", "Пользователь не найден"];
const REGISTRATION_HEADING: &str = "Дата регистрации";
const BANNED_MARKER: &str = "заблокирован";
const SUPPORT_MARKER: &str = "поддержка";
const UNKNOWN_DATE: &str = "Не указана";

/// What a 200 response turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum ProfilePage {
    Profile(Profile),
    /// The site answers some missing IDs with a soft 404 page.
    NotFound,
}

/// Extract the fixed profile shape from a profile page.
pub fn parse_profile(id: u64, html_body: &str) -> ProfilePage {
    let document = Html::parse_document(html_body);

    let title = document
        .select(&TITLE_SELECTOR)
        .next()
        .map(collect_text)
        .unwrap_or_default();
    if title.trim().is_empty() || NOT_FOUND_MARKERS.iter().any(|m| title.contains(m)) {
        return ProfilePage::NotFound;
    }

    let nickname = match NICKNAME_PATTERN
        .captures(&title)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
    {
        Some(nickname) if !nickname.is_empty() => nickname,
        _ => return ProfilePage::NotFound,
    };

    let rating = document
        .select(&RATING_SELECTOR)
        .next()
        .map(collect_text)
        .and_then(|text| parse_decimal(&text));

    let review_count = document
        .select(&REVIEW_COUNT_SELECTOR)
        .next()
        .map(collect_text)
        .map(|text| text.chars().filter(char::is_ascii_digit).collect::<String>())
        .and_then(|digits| digits.parse::<u32>().ok())
        .unwrap_or(0);

    let lot_count = document.select(&LOT_SELECTOR).count() as u32;

    ProfilePage::Profile(Profile {
        id,
        nickname,
        registered_at: registration_date(&document),
        rating,
        review_count,
        lot_count,
        is_banned: any_label_contains(&document, &DANGER_LABEL_SELECTOR, BANNED_MARKER),
        is_support: any_label_contains(&document, &SUCCESS_LABEL_SELECTOR, SUPPORT_MARKER),
        scraped_at: Utc::now(),
    })
}

fn collect_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>()
}

/// The date sits in the first line of the value; the second line holds the relative age.
fn registration_date(document: &Html) -> String {
    for item in document.select(&PARAM_ITEM_SELECTOR) {
        let is_registration = item
            .select(&PARAM_HEADING_SELECTOR)
            .next()
            .is_some_and(|heading| collect_text(heading).trim() == REGISTRATION_HEADING);
        if !is_registration {
            continue;
        }
        if let Some(value) = item.select(&PARAM_VALUE_SELECTOR).next() {
            if let Some(first) = value.text().map(str::trim).find(|line| !line.is_empty()) {
                return first.to_string();
            }
        }
    }
    UNKNOWN_DATE.to_string()
}

fn any_label_contains(document: &Html, selector: &Selector, marker: &str) -> bool {
    document
        .select(selector)
        .any(|label| collect_text(label).contains(marker))
}

fn parse_decimal(text: &str) -> Option<f64> {
    DECIMAL_PATTERN
        .find(text)
        .and_then(|m| m.as_str().replace(',', ".").parse::<f64>().ok())
}
