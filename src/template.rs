//! All pages, rendered with maud. Content pages share a navbar shell; the
//! login and password pages stand alone since they are reachable without a
//! session.

use maud::{html, Markup, PreEscaped, DOCTYPE};
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::index::ContentEntry;
use crate::sessions::Session;

/// Everything the navbar needs about the current request.
pub struct PageContext<'a> {
    pub config: &'a ServerConfig,
    pub username: Option<&'a str>,
    pub is_admin: bool,
    /// Pre-escaped dropdown fragment from the content index.
    pub dropdown: &'a str,
}

fn head(title: &str) -> Markup {
    html! {
        head {
            meta charset="utf-8";
            meta name="viewport" content="width=device-width, initial-scale=1";
            title { (title) }
            link rel="stylesheet" href="/style.css";
        }
    }
}

/// The navbar fragment, also served bare at `GET /nav`.
pub fn navbar(ctx: &PageContext) -> Markup {
    html! {
        nav {
            a.brand href="/" { (ctx.config.server_name) }
            details.dropdown {
                summary { (ctx.config.dropdown_name) }
                div.dropdown-menu {
                    (PreEscaped(ctx.dropdown))
                }
            }
            a href="/sitemap" { "Sitemap" }
            @if ctx.is_admin {
                a href="/admin" { "Admin" }
            }
            @if let Some(name) = ctx.username {
                span.user { (name) }
                a href="/renewpw" { "Change password" }
                a href="/logout" { "Logout" }
            }
        }
    }
}

fn shell(ctx: &PageContext, title: &str, body: Markup) -> Markup {
    html! {
        (DOCTYPE)
        html lang="en" {
            (head(title))
            body {
                (navbar(ctx))
                main {
                    (body)
                }
            }
        }
    }
}

/// A rendered markdown document inside the shell.
pub fn content_page(ctx: &PageContext, title: &str, content_html: &str) -> Markup {
    shell(ctx, title, html! { (PreEscaped(content_html)) })
}

pub fn folder_overview(ctx: &PageContext, entries: &[Arc<ContentEntry>]) -> Markup {
    shell(
        ctx,
        "Folder overview",
        html! {
            h1 { "Folder overview" }
            ul {
                @for entry in entries {
                    li { a href=(entry.url) { (entry.url) } }
                }
            }
        },
    )
}

pub fn not_found(ctx: &PageContext) -> Markup {
    shell(
        ctx,
        "Not found",
        html! {
            h1 { "The requested page could not be found." }
            h3 { a href="/" { "Here" } " is the way back to the start page." }
        },
    )
}

pub fn admin_page(ctx: &PageContext, admin_only: bool) -> Markup {
    shell(
        ctx,
        "Admin panel",
        html! {
            h1 { "Admin panel" }
            @if let Some(name) = ctx.username {
                p { "Logged in as " b { (name) } "." }
            }
            section {
                h5 { "Admin-only mode" }
                p {
                    "Admin-only mode is currently "
                    b { @if admin_only { "enabled" } @else { "disabled" } }
                    "."
                }
                form method="post" action="/adminonly" {
                    button type="submit" {
                        @if admin_only { "Disable" } @else { "Enable" }
                    }
                }
            }
            section {
                h5 { "Management" }
                ul {
                    li { a href="/sessions" { "Users and sessions" } }
                    li { a href="/reload" { "Reload content and stores" } }
                    li { a href="/invalidate" { "Invalidate all sessions (master)" } }
                }
            }
        },
    )
}

pub fn sessions_page(
    ctx: &PageContext,
    usernames: &[String],
    sessions: &[(String, Session)],
) -> Markup {
    shell(
        ctx,
        "Users and sessions",
        html! {
            h5 { "Users" }
            ul {
                @for name in usernames {
                    li { (name) }
                }
            }
            h5 { "Sessions" }
            ul {
                @for (token, session) in sessions {
                    li {
                        i { (token) }
                        " is "
                        b { (session.username) " from " (session.ip) }
                        "."
                    }
                }
            }
        },
    )
}

/// Login page. With `locked` the admin-only notice is shown; the form stays
/// so admins can still sign in during a lockdown.
pub fn login_page(
    server_name: &str,
    invalid_retry: bool,
    redirect_label: &str,
    locked: bool,
) -> Markup {
    html! {
        (DOCTYPE)
        html lang="en" {
            (head(&format!("Login — {}", server_name)))
            body {
                main {
                    h1 { "Login" }
                    @if locked {
                        p.notice {
                            "This server is in admin-only mode. Only admin accounts can sign in."
                        }
                    }
                    @if invalid_retry {
                        p.error { "Invalid username or password." }
                    }
                    p { "You will be taken to " b { (redirect_label) } " after signing in." }
                    form method="post" action="/login" {
                        label { "Username" input type="text" name="username" required; }
                        label { "Password" input type="password" name="password" required; }
                        button type="submit" { "Sign in" }
                    }
                }
            }
        }
    }
}

pub fn renewpw_page(server_name: &str, invalid_retry: bool) -> Markup {
    html! {
        (DOCTYPE)
        html lang="en" {
            (head(&format!("Change password — {}", server_name)))
            body {
                main {
                    h1 { "Change password" }
                    @if invalid_retry {
                        p.error { "Invalid current password." }
                    }
                    form method="post" action="/renewpw" {
                        label { "Current password" input type="password" name="current" required; }
                        label { "New password" input type="password" name="new" required; }
                        button type="submit" { "Change password" }
                    }
                }
            }
        }
    }
}
