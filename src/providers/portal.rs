// Court portal client
// Cookie-based HTTP integration with the portal's login and Smart Search

use crate::config::PortalConfig;
use crate::providers::rate_limiter::RateLimiter;
use crate::providers::{default_headers, parser, PortalError, PortalResult};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, COOKIE, LOCATION, SET_COOKIE, USER_AGENT};
use reqwest::redirect::Policy;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use url::Url;

const LOGIN_PATH: &str = "Portal/Account/Login";
const SMART_SEARCH_PATH: &str = "Portal/SmartSearch/SmartSearch/SmartSearch";
const SMART_SEARCH_RESULTS_PATH: &str = "Portal/SmartSearch/SmartSearchResults";

// Rendered by the portal when a login attempt is rejected.
const INVALID_CREDENTIALS_SENTINEL: &str = "Invalid Email or password";

// Category filter applied when a name search is restricted to criminal cases.
const CRIMINAL_CATEGORY: &str = "CR";

/// Default session lifetime when no cookie carries an expiry.
const DEFAULT_SESSION_HOURS: i64 = 24;

/// One cookie of a persisted session bundle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
}

pub type CookieBundle = Vec<SessionCookie>;

/// Result of a successful portal login.
#[derive(Debug, Clone)]
pub struct LoginSession {
    pub cookies: CookieBundle,
    pub expires_at: DateTime<Utc>,
}

/// Party-name Smart Search parameters.
#[derive(Debug, Clone)]
pub struct PartySearch {
    pub name: String,
    pub date_of_birth: Option<NaiveDate>,
    pub sounds_like: bool,
    pub criminal_only: bool,
}

pub struct PortalClient {
    client: Client,
    base_url: Url,
    case_path: String,
    limiter: RateLimiter,
}

impl PortalClient {
    pub fn new(config: &PortalConfig) -> PortalResult<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| PortalError::Configuration(format!("Invalid portal URL: {}", e)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in default_headers() {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| PortalError::Configuration(format!("Invalid header {}: {}", name, e)))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| PortalError::Configuration(format!("Invalid header value: {}", e)))?;
            headers.insert(header_name, header_value);
        }

        // Redirects are handled explicitly: a 302 to the login page is the
        // stale-session signal workers react to.
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .redirect(Policy::none())
            .default_headers(headers)
            .build()
            .map_err(PortalError::Network)?;

        Ok(Self {
            client,
            base_url,
            case_path: config.case_path.trim_matches('/').to_string(),
            limiter: RateLimiter::new(config.requests_per_minute, config.burst_limit),
        })
    }

    fn join(&self, path: &str) -> PortalResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| PortalError::Configuration(format!("Invalid endpoint {}: {}", path, e)))
    }

    /// Perform a credential login and capture the resulting cookie bundle.
    #[instrument(skip(self, username, password))]
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        user_agent: &str,
    ) -> PortalResult<LoginSession> {
        self.limiter.acquire().await;
        let login_url = self.join(LOGIN_PATH)?;

        debug!("Fetching portal login form");
        let form_response = self
            .client
            .get(login_url.clone())
            .header(USER_AGENT, user_agent)
            .send()
            .await
            .map_err(PortalError::Network)?;
        check_server_error(&form_response)?;

        let mut cookies = Vec::new();
        let mut max_expiry = None;
        absorb_set_cookies(&form_response, &mut cookies, &mut max_expiry);

        let form_html = form_response.text().await.map_err(PortalError::Network)?;
        let token = parser::parse_verification_token(&form_html).unwrap_or_default();

        let mut form = vec![
            ("UserName", username.to_string()),
            ("Password", password.to_string()),
        ];
        if !token.is_empty() {
            form.push(("__RequestVerificationToken", token));
        }

        debug!("Submitting portal login");
        let login_response = self
            .client
            .post(login_url)
            .header(USER_AGENT, user_agent)
            .header(COOKIE, cookie_header(&cookies))
            .form(&form)
            .send()
            .await
            .map_err(PortalError::Network)?;
        check_server_error(&login_response)?;

        absorb_set_cookies(&login_response, &mut cookies, &mut max_expiry);

        if !login_response.status().is_redirection() {
            let body = login_response.text().await.map_err(PortalError::Network)?;
            if body.contains(INVALID_CREDENTIALS_SENTINEL) {
                warn!("Portal rejected credentials");
                return Err(PortalError::AuthenticationFailed(
                    "Invalid Email or password".to_string(),
                ));
            }
        }

        if cookies.is_empty() {
            return Err(PortalError::InvalidResponse(
                "login succeeded but no session cookies were issued".to_string(),
            ));
        }

        let expires_at =
            max_expiry.unwrap_or_else(|| Utc::now() + Duration::hours(DEFAULT_SESSION_HOURS));
        info!(expires_at = %expires_at, "Portal login succeeded");

        Ok(LoginSession {
            cookies,
            expires_at,
        })
    }

    /// Smart Search by exact case number. Returns the results page HTML.
    #[instrument(skip(self, cookies, user_agent))]
    pub async fn search_by_case_number(
        &self,
        cookies: &CookieBundle,
        user_agent: &str,
        case_number: &str,
    ) -> PortalResult<String> {
        let form = vec![
            ("caseCriteria.SearchCriteria", case_number.to_string()),
            ("caseCriteria.SearchCases", "true".to_string()),
        ];
        self.smart_search(cookies, user_agent, form).await
    }

    /// Smart Search by party name. Returns the results page HTML.
    #[instrument(skip(self, cookies, user_agent, party))]
    pub async fn search_by_party(
        &self,
        cookies: &CookieBundle,
        user_agent: &str,
        party: &PartySearch,
    ) -> PortalResult<String> {
        self.smart_search(cookies, user_agent, party_form(party)).await
    }

    async fn smart_search(
        &self,
        cookies: &CookieBundle,
        user_agent: &str,
        form: Vec<(&'static str, String)>,
    ) -> PortalResult<String> {
        self.limiter.acquire().await;

        let submit_response = self
            .client
            .post(self.join(SMART_SEARCH_PATH)?)
            .header(USER_AGENT, user_agent)
            .header(COOKIE, cookie_header(cookies))
            .form(&form)
            .send()
            .await
            .map_err(PortalError::Network)?;
        self.check_page_response(&submit_response)?;

        let results_response = self
            .client
            .get(self.join(SMART_SEARCH_RESULTS_PATH)?)
            .header(USER_AGENT, user_agent)
            .header(COOKIE, cookie_header(cookies))
            .send()
            .await
            .map_err(PortalError::Network)?;
        self.check_page_response(&results_response)?;

        let html = results_response.text().await.map_err(PortalError::Network)?;
        self.check_page_body(&html)?;
        Ok(html)
    }

    /// Fetch the detail page for a resolved portal case id.
    #[instrument(skip(self, cookies, user_agent))]
    pub async fn fetch_case_detail(
        &self,
        cookies: &CookieBundle,
        user_agent: &str,
        case_id: &str,
    ) -> PortalResult<String> {
        self.limiter.acquire().await;

        let path = format!("{}/{}", self.case_path, urlencoding::encode(case_id));
        let response = self
            .client
            .get(self.join(&path)?)
            .header(USER_AGENT, user_agent)
            .header(COOKIE, cookie_header(cookies))
            .send()
            .await
            .map_err(PortalError::Network)?;
        self.check_page_response(&response)?;

        let html = response.text().await.map_err(PortalError::Network)?;
        self.check_page_body(&html)?;
        Ok(html)
    }

    fn check_page_response(&self, response: &Response) -> PortalResult<()> {
        if is_login_redirect(response) {
            return Err(PortalError::SessionExpired);
        }
        check_server_error(response)
    }

    fn check_page_body(&self, html: &str) -> PortalResult<()> {
        if parser::is_busy_page(html) {
            return Err(PortalError::Busy);
        }
        if parser::is_login_page(html) {
            return Err(PortalError::SessionExpired);
        }
        Ok(())
    }
}

fn party_form(party: &PartySearch) -> Vec<(&'static str, String)> {
    let mut form = vec![
        ("caseCriteria.SearchCriteria", party.name.clone()),
        ("caseCriteria.SearchCases", "true".to_string()),
        ("caseCriteria.SearchByPartyName", "true".to_string()),
    ];
    if let Some(dob) = party.date_of_birth {
        let formatted = dob.format("%m/%d/%Y").to_string();
        form.push(("caseCriteria.DOBFrom", formatted.clone()));
        form.push(("caseCriteria.DOBTo", formatted));
    }
    if party.sounds_like {
        form.push(("caseCriteria.UseSoundex", "true".to_string()));
    }
    if party.criminal_only {
        form.push(("caseCriteria.CaseCategories", CRIMINAL_CATEGORY.to_string()));
    }
    form
}

fn check_server_error(response: &Response) -> PortalResult<()> {
    let status = response.status();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(PortalError::ServiceUnavailable(format!(
            "HTTP {}",
            status
        )));
    }
    Ok(())
}

fn is_login_redirect(response: &Response) -> bool {
    response.status().is_redirection()
        && response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|location| location.to_lowercase().contains("login"))
            .unwrap_or(false)
}

/// Assemble a `Cookie` header from a stored bundle.
pub fn cookie_header(cookies: &CookieBundle) -> String {
    cookies
        .iter()
        .map(|cookie| format!("{}={}", cookie.name, cookie.value))
        .collect::<Vec<_>>()
        .join("; ")
}

fn absorb_set_cookies(
    response: &Response,
    cookies: &mut CookieBundle,
    max_expiry: &mut Option<DateTime<Utc>>,
) {
    for header in response.headers().get_all(SET_COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        let Some((cookie, expiry)) = parse_set_cookie(raw) else {
            continue;
        };

        if let Some(expiry) = expiry {
            if max_expiry.map(|current| expiry > current).unwrap_or(true) {
                *max_expiry = Some(expiry);
            }
        }

        match cookies.iter_mut().find(|existing| existing.name == cookie.name) {
            Some(existing) => existing.value = cookie.value,
            None => cookies.push(cookie),
        }
    }
}

fn parse_set_cookie(raw: &str) -> Option<(SessionCookie, Option<DateTime<Utc>>)> {
    let mut parts = raw.split(';');
    let (name, value) = parts.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut expiry = None;
    for attribute in parts {
        let Some((key, val)) = attribute.split_once('=') else {
            continue;
        };
        match key.trim().to_lowercase().as_str() {
            "max-age" => {
                if let Ok(seconds) = val.trim().parse::<i64>() {
                    expiry = Some(Utc::now() + Duration::seconds(seconds));
                }
            }
            "expires" => {
                if expiry.is_none() {
                    expiry = parse_cookie_expiry(val.trim());
                }
            }
            _ => {}
        }
    }

    Some((
        SessionCookie {
            name: name.to_string(),
            value: value.trim().to_string(),
        },
        expiry,
    ))
}

fn parse_cookie_expiry(value: &str) -> Option<DateTime<Utc>> {
    let formats = ["%a, %d %b %Y %H:%M:%S GMT", "%a, %d-%b-%Y %H:%M:%S GMT"];
    formats
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_header_assembly() {
        let bundle = vec![
            SessionCookie {
                name: "ASP.NET_SessionId".to_string(),
                value: "abc".to_string(),
            },
            SessionCookie {
                name: ".AspNet.Cookies".to_string(),
                value: "xyz".to_string(),
            },
        ];
        assert_eq!(
            cookie_header(&bundle),
            "ASP.NET_SessionId=abc; .AspNet.Cookies=xyz"
        );
        assert_eq!(cookie_header(&Vec::new()), "");
    }

    #[test]
    fn set_cookie_parsing_with_max_age() {
        let (cookie, expiry) =
            parse_set_cookie("session=abc123; Max-Age=3600; Path=/; HttpOnly").unwrap();
        assert_eq!(cookie.name, "session");
        assert_eq!(cookie.value, "abc123");
        let expiry = expiry.unwrap();
        let delta = expiry - Utc::now();
        assert!(delta > Duration::minutes(59) && delta <= Duration::minutes(61));
    }

    #[test]
    fn set_cookie_parsing_with_expires() {
        let (cookie, expiry) =
            parse_set_cookie("auth=tok; Expires=Wed, 21 Oct 2065 07:28:00 GMT; Secure").unwrap();
        assert_eq!(cookie.name, "auth");
        assert_eq!(cookie.value, "tok");
        assert_eq!(expiry.unwrap().format("%Y-%m-%d").to_string(), "2065-10-21");
    }

    #[test]
    fn set_cookie_without_expiry() {
        let (cookie, expiry) = parse_set_cookie("flag=1; Path=/").unwrap();
        assert_eq!(cookie.name, "flag");
        assert!(expiry.is_none());
    }

    #[test]
    fn malformed_set_cookie_is_ignored() {
        assert!(parse_set_cookie("no-equals-sign").is_none());
        assert!(parse_set_cookie("=value; Path=/").is_none());
    }

    #[test]
    fn party_form_fields() {
        let party = PartySearch {
            name: "Doe, Jane".to_string(),
            date_of_birth: NaiveDate::from_ymd_opt(1980, 1, 1),
            sounds_like: true,
            criminal_only: true,
        };
        let form = party_form(&party);

        let get = |key: &str| {
            form.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("caseCriteria.SearchCriteria"), Some("Doe, Jane"));
        assert_eq!(get("caseCriteria.SearchByPartyName"), Some("true"));
        assert_eq!(get("caseCriteria.DOBFrom"), Some("01/01/1980"));
        assert_eq!(get("caseCriteria.DOBTo"), Some("01/01/1980"));
        assert_eq!(get("caseCriteria.UseSoundex"), Some("true"));
        assert_eq!(get("caseCriteria.CaseCategories"), Some("CR"));
    }

    #[test]
    fn minimal_party_form_omits_optional_fields() {
        let party = PartySearch {
            name: "Doe, Jane".to_string(),
            date_of_birth: None,
            sounds_like: false,
            criminal_only: false,
        };
        let form = party_form(&party);
        assert_eq!(form.len(), 3);
        assert!(!form.iter().any(|(k, _)| k.contains("DOB")));
        assert!(!form.iter().any(|(k, _)| k.contains("Soundex")));
    }
}
