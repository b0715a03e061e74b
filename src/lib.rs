/*!
# Event Attendance

A bilingual (Vietnamese / English) attendance service for events, built in Rust.

## Overview

Organizers create events, enroll attendees and hand each attendee a QR code.
At the door, staff scan the code in the browser (or type the student id) and
the server moves the attendee from *pending* to *checked in* and later to
*checked out*. Every change lands in an append-only check-in log and is
pushed to open dashboards over WebSocket.

## Architecture

### Browser Layer
- Decodes QR codes from the camera and posts the token to the API
- Subscribes to `/ws/events/{id}` for live updates

### Backend Layer
- **Technologies**: Rust, axum, tokio
- **Core Components**:
  - Storage - SQLite through rusqlite, versioned schema migrations
  - Status machine - forward-only transitions with a re-scan cooldown
  - Realtime - one broadcast channel per event
  - Caches - TTL caches for sessions and dashboard statistics
  - Auth - Argon2 passwords, cookie sessions, optional OpenID Connect

### Data Persistence Layer
- `users`, `events`, `event_collaborators`, `attendees`, `checkin_logs`
- CSV and XLSX export of attendee lists

## Modules

- **models**: Domain records and the attendee status machine
- **storage**: SQLite access (users, events, attendees, check-ins, stats)
- **cache**: Thread-safe TTL cache
- **qr**: Token generation and PNG/SVG rendering
- **downloader**: Export functionality (CSV, XLSX)
- **config**: Layered configuration (defaults, TOML, environment)
- **logging**: tracing subscriber setup
- **login**: Registration, login, sessions, password reset
- **oidc**: OpenID Connect sign-in
- **mailer**: Reset codes and QR codes by e-mail
- **events**, **collaborators**, **attendees**, **checkin**, **dashboard**: HTTP handlers
- **realtime**: WebSocket fan-out
- **app**: Shared state, routing and middleware

## REST API Endpoints

- `/api/auth/{register,login,logout,me,change-password,forgot-password,reset-password}`
- `/auth/oidc/login`, `/auth/oidc/callback` - Single sign-on
- `/api/events` and `/api/events/{id}` - Event CRUD
- `/api/events/{id}/collaborators` - Sharing with scoped permissions
- `/api/events/{id}/attendees` - Enrollment, QR images, resets
- `/api/events/{id}/checkin` - Scan or manual check-in/check-out
- `/api/events/{id}/logs`, `/api/events/{id}/stats` - Activity and numbers
- `/api/events/{id}/export?format=csv|xlsx` - Attendee list download
- `/api/dashboard` - Overview across all visible events
- `/ws/events/{id}` - Live feed
*/

pub mod cache;
pub mod config;
pub mod downloader;
pub mod error;
pub mod logging;
pub mod models;
pub mod qr;
pub mod storage;

#[cfg(feature = "web")]
pub mod app;
#[cfg(feature = "web")]
pub mod attendees;
#[cfg(feature = "web")]
pub mod checkin;
#[cfg(feature = "web")]
pub mod collaborators;
#[cfg(feature = "web")]
pub mod dashboard;
#[cfg(feature = "web")]
pub mod events;
#[cfg(feature = "web")]
pub mod login;
#[cfg(feature = "web")]
pub mod mailer;
#[cfg(feature = "web")]
pub mod oidc;
#[cfg(feature = "web")]
pub mod realtime;

pub use config::Config;
pub use error::{Error, Result};
pub use storage::Storage;
