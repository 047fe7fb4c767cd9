use regex::Regex;

use crate::action::{
    Action, ActionKind, ClickTarget, ScrollDirection, DEFAULT_SCROLL_AMOUNT, MAX_SCROLL_AMOUNT,
};
use crate::perception::types::SemanticRole;
use crate::perception::ScreenContext;
use crate::planner::WAIT_FOR_TEXT_PREFIX;

const SEARCH_URL: &str = "https://www.google.com/search?q=";

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static planner pattern")
}

/// Compiled task patterns, tried in declaration order per segment.
pub struct RuleSet {
    separator: Regex,
    navigate: Regex,
    launch: Regex,
    search: Regex,
    type_text: Regex,
    press: Regex,
    scroll: Regex,
    click: Regex,
    wait: Regex,
}

impl RuleSet {
    pub fn new() -> Self {
        Self {
            separator: re(r"(?i)(?:\s*,\s*|\s+)(?:and\s+)?then\s+"),
            navigate: re(r"(?i)^(?:go\s+to|navigate\s+to|browse\s+to|visit|open\s+url)\s+(?P<url>\S+)$"),
            launch: re(r"(?i)^(?:open|launch|start)\s+(?:the\s+)?(?P<app>.+?)(?:\s+app)?$"),
            search: re(r"(?i)^(?:search\s+(?:for\s+)?|google\s+|look\s+up\s+)(?P<query>.+)$"),
            type_text: re(r"(?i)^(?:type|enter|write)\s+(?P<text>.+)$"),
            press: re(r"(?i)^(?:press|hit)\s+(?P<key>.+)$"),
            scroll: re(r"(?i)^scroll\s+(?P<dir>up|down|left|right)(?:\s+(?:by\s+)?(?P<n>\d+))?$"),
            click: re(r"(?i)^(?:click|select|tap)\s+(?:on\s+)?(?:the\s+)?(?P<label>.+?)(?:\s+(?:button|link))?$"),
            wait: re(r"(?i)^wait\s+(?:for\s+)?(?P<n>\d+)\s*(?P<unit>ms|milliseconds?|s|secs?|seconds?)?$"),
        }
    }

    /// Splits a description on `then` separators, dropping empty pieces and
    /// trailing punctuation.
    pub fn segments<'a>(&self, task: &'a str) -> Vec<&'a str> {
        self.separator
            .split(task.trim())
            .map(|s| s.trim().trim_end_matches(['.', '!']).trim())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn expand(&self, segment: &str, ctx: &ScreenContext) -> Option<Vec<Action>> {
        if let Some(c) = self.navigate.captures(segment) {
            return Some(vec![navigate(&c["url"])]);
        }
        if let Some(c) = self.launch.captures(segment) {
            let target = c["app"].trim();
            if looks_like_url(target) {
                return Some(vec![navigate(target)]);
            }
            return Some(vec![Action::new(
                ActionKind::LaunchApp { name: target.to_string() },
                format!("launch {target}"),
            )]);
        }
        if let Some(c) = self.search.captures(segment) {
            return Some(search(unquote(&c["query"]), ctx));
        }
        if let Some(c) = self.type_text.captures(segment) {
            let text = unquote(&c["text"]);
            return Some(vec![Action::new(
                ActionKind::Type { text: text.to_string() },
                "type requested text",
            )]);
        }
        if let Some(c) = self.press.captures(segment) {
            let key = c["key"].trim().to_lowercase();
            return Some(vec![Action::new(
                ActionKind::Press { key: key.clone() },
                format!("press {key}"),
            )]);
        }
        if let Some(c) = self.scroll.captures(segment) {
            let direction = ScrollDirection::parse(&c["dir"])?;
            let amount = c
                .name("n")
                .and_then(|m| m.as_str().parse::<i32>().ok())
                .map_or(DEFAULT_SCROLL_AMOUNT, |n| n.clamp(1, MAX_SCROLL_AMOUNT));
            return Some(vec![Action::new(
                ActionKind::Scroll { direction, amount },
                "scroll requested",
            )]);
        }
        if let Some(c) = self.wait.captures(segment) {
            let n: u64 = c["n"].parse().ok()?;
            let ms = match c.name("unit").map(|m| m.as_str().to_lowercase()) {
                Some(u) if u.starts_with('m') => n,
                _ => n.saturating_mul(1000),
            };
            return Some(vec![Action::new(ActionKind::Wait { duration_ms: ms }, "requested pause")]);
        }
        if let Some(c) = self.click.captures(segment) {
            let label = unquote(&c["label"]);
            let element = find_clickable_by_text(ctx, label)?;
            return Some(vec![Action::new(
                ActionKind::Click { target: ClickTarget::Element { element_id: element } },
                format!("click '{label}'"),
            )]);
        }
        None
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::new()
    }
}

fn navigate(url: &str) -> Action {
    Action::new(ActionKind::Navigate { url: url.to_string() }, format!("open {url}"))
}

fn search(query: &str, ctx: &ScreenContext) -> Vec<Action> {
    let validation = format!("{WAIT_FOR_TEXT_PREFIX}{query}");
    match find_input_field(ctx) {
        Some(id) => vec![
            Action::new(
                ActionKind::Click { target: ClickTarget::Element { element_id: id } },
                "focus the search field",
            ),
            Action::new(ActionKind::Type { text: query.to_string() }, "enter the query"),
            Action::new(ActionKind::Press { key: "enter".into() }, "submit the search")
                .with_validation(validation),
        ],
        None => vec![Action::new(
            ActionKind::Navigate {
                url: format!("{SEARCH_URL}{}", urlencoding::encode(query)),
            },
            "search via the browser",
        )
        .with_validation(validation)],
    }
}

/// First visible text-entry element, preferring ones labelled as search.
fn find_input_field(ctx: &ScreenContext) -> Option<u32> {
    let is_entry = |t: &str| {
        let t = t.to_lowercase();
        ["input", "search", "textbox", "edit", "combobox"]
            .iter()
            .any(|k| t.contains(k))
    };
    let candidates: Vec<_> = ctx
        .elements()
        .iter()
        .filter(|e| e.semantic_role == SemanticRole::Input && is_entry(&e.element_type))
        .collect();
    candidates
        .iter()
        .find(|e| {
            e.element_type.to_lowercase().contains("search")
                || e.text.to_lowercase().contains("search")
        })
        .or_else(|| candidates.first())
        .map(|e| e.id)
}

fn find_clickable_by_text(ctx: &ScreenContext, label: &str) -> Option<u32> {
    let label = label.to_lowercase();
    ctx.elements()
        .iter()
        .find(|e| e.clickable && !e.text.is_empty() && e.text.to_lowercase().contains(&label))
        .map(|e| e.id)
}

fn looks_like_url(s: &str) -> bool {
    if s.contains("://") {
        return true;
    }
    let lower = s.to_lowercase();
    !s.contains(char::is_whitespace)
        && s.contains('.')
        && !s.ends_with('.')
        && !lower.ends_with(".exe")
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .or_else(|| s.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')))
        .unwrap_or(s)
}
