//! Feed identifiers.
//!
//! Consumers address feeds by exact strings (`home`, `public:local:media`,
//! `account:<id>:pinned`, ...). [`FeedId`] parses and renders those strings
//! and knows which pull resource and streaming topic back each feed.

use std::fmt;
use std::str::FromStr;

use crate::FeedError;

/// Which view of an account's statuses a feed shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountView {
    /// Statuses without replies (`account:<id>`).
    Statuses,
    /// Statuses including replies (`account:<id>:with_replies`).
    WithReplies,
    /// Only statuses with media (`account:<id>:media`).
    Media,
    /// Pinned statuses (`account:<id>:pinned`).
    Pinned,
}

/// Which view of a group timeline a feed shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupView {
    /// Every status (`group:<id>`).
    All,
    /// Only statuses with media (`group:<id>:media`).
    Media,
    /// Pinned statuses (`group:<id>:pinned`).
    Pinned,
}

/// Broad category of a feed, used to pick defaults such as the queue cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    Timeline,
    Notifications,
    Chat,
}

/// A named feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FeedId {
    Home,
    Public { local: bool, media: bool },
    PublicRemote,
    Remote { instance: String, media: bool },
    Hashtag { name: String, local: bool },
    Account { id: String, view: AccountView },
    Group { id: String, view: GroupView },
    List { id: String },
    Direct,
    Bookmarks,
    Notifications,
    Chat { id: String },
}

/// Path and query parameters of the pull resource backing a feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub path: String,
    pub query: Vec<(&'static str, String)>,
}

impl Resource {
    fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            query: Vec::new(),
        }
    }

    fn flag(mut self, key: &'static str, on: bool) -> Self {
        if on {
            self.query.push((key, "true".to_string()));
        }
        self
    }

    fn param(mut self, key: &'static str, value: &str) -> Self {
        self.query.push((key, value.to_string()));
        self
    }
}

/// A streaming topic, as named by the push transport.
///
/// Topics such as `hashtag` carry one argument (`tag`); on the wire the
/// server echoes them back as `["hashtag", "<tag>"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamTopic {
    pub name: String,
    pub arg: Option<String>,
}

impl StreamTopic {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arg: None,
        }
    }

    pub fn with_arg(name: impl Into<String>, arg: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arg: Some(arg.into()),
        }
    }

    /// Rebuild a topic from the `stream` array of an incoming message.
    pub fn from_stream_array(parts: &[String]) -> Option<Self> {
        let (name, rest) = parts.split_first()?;
        Some(Self {
            name: name.clone(),
            arg: rest.first().cloned(),
        })
    }

    /// Name of the subscribe-message field that carries the argument.
    pub fn arg_key(&self) -> Option<&'static str> {
        match self.name.as_str() {
            "hashtag" | "hashtag:local" => Some("tag"),
            "list" => Some("list"),
            "group" => Some("group"),
            _ => None,
        }
    }

    /// Build the JSON control message for `subscribe` or `unsubscribe`.
    pub fn control_message(&self, kind: &str) -> serde_json::Value {
        let mut msg = serde_json::json!({
            "type": kind,
            "stream": self.name,
        });
        if let (Some(key), Some(arg)) = (self.arg_key(), &self.arg) {
            msg[key] = serde_json::Value::String(arg.clone());
        }
        msg
    }
}

impl fmt::Display for StreamTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.arg {
            Some(arg) => write!(f, "{}[{}]", self.name, arg),
            None => f.write_str(&self.name),
        }
    }
}

impl FeedId {
    pub fn kind(&self) -> FeedKind {
        match self {
            FeedId::Notifications => FeedKind::Notifications,
            FeedId::Chat { .. } => FeedKind::Chat,
            _ => FeedKind::Timeline,
        }
    }

    /// The pull resource backing this feed.
    pub fn resource(&self) -> Resource {
        match self {
            FeedId::Home => Resource::new("/api/v1/timelines/home"),
            FeedId::Public { local, media } => Resource::new("/api/v1/timelines/public")
                .flag("local", *local)
                .flag("only_media", *media),
            FeedId::PublicRemote => Resource::new("/api/v1/timelines/public").flag("remote", true),
            FeedId::Remote { instance, media } => Resource::new("/api/v1/timelines/public")
                .param("instance", instance)
                .flag("only_media", *media),
            FeedId::Hashtag { name, local } => {
                Resource::new(format!("/api/v1/timelines/tag/{}", name)).flag("local", *local)
            }
            FeedId::Account { id, view } => {
                let res = Resource::new(format!("/api/v1/accounts/{}/statuses", id));
                match view {
                    AccountView::Statuses => res.flag("exclude_replies", true),
                    AccountView::WithReplies => res,
                    AccountView::Media => res.flag("only_media", true),
                    AccountView::Pinned => res.flag("pinned", true),
                }
            }
            FeedId::Group { id, view } => {
                let res = Resource::new(format!("/api/v1/timelines/group/{}", id));
                match view {
                    GroupView::All => res,
                    GroupView::Media => res.flag("only_media", true),
                    GroupView::Pinned => res.flag("pinned", true),
                }
            }
            FeedId::List { id } => Resource::new(format!("/api/v1/timelines/list/{}", id)),
            FeedId::Direct => Resource::new("/api/v1/timelines/direct"),
            FeedId::Bookmarks => Resource::new("/api/v1/bookmarks"),
            FeedId::Notifications => Resource::new("/api/v1/notifications"),
            FeedId::Chat { id } => Resource::new(format!("/api/v1/pleroma/chats/{}/messages", id)),
        }
    }

    /// The streaming topic that delivers pushed items for this feed, if any.
    ///
    /// Account timelines, bookmarks, remote-instance timelines and the
    /// pinned/media group views are pull-only.
    pub fn stream_topic(&self) -> Option<StreamTopic> {
        match self {
            FeedId::Home | FeedId::Chat { .. } => Some(StreamTopic::new("user")),
            FeedId::Notifications => Some(StreamTopic::new("user:notification")),
            FeedId::Public { local, media } => {
                let name = match (local, media) {
                    (false, false) => "public",
                    (true, false) => "public:local",
                    (false, true) => "public:media",
                    (true, true) => "public:local:media",
                };
                Some(StreamTopic::new(name))
            }
            FeedId::PublicRemote => Some(StreamTopic::new("public:remote")),
            FeedId::Hashtag { name, local } => {
                let topic = if *local { "hashtag:local" } else { "hashtag" };
                Some(StreamTopic::with_arg(topic, name.clone()))
            }
            FeedId::List { id } => Some(StreamTopic::with_arg("list", id.clone())),
            FeedId::Direct => Some(StreamTopic::new("direct")),
            FeedId::Group {
                id,
                view: GroupView::All,
            } => Some(StreamTopic::with_arg("group", id.clone())),
            FeedId::Remote { .. }
            | FeedId::Account { .. }
            | FeedId::Group { .. }
            | FeedId::Bookmarks => None,
        }
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedId::Home => f.write_str("home"),
            FeedId::Public { local, media } => {
                f.write_str("public")?;
                if *local {
                    f.write_str(":local")?;
                }
                if *media {
                    f.write_str(":media")?;
                }
                Ok(())
            }
            FeedId::PublicRemote => f.write_str("public:remote"),
            FeedId::Remote { instance, media } => {
                write!(f, "remote:{}", instance)?;
                if *media {
                    f.write_str(":media")?;
                }
                Ok(())
            }
            FeedId::Hashtag { name, local } => {
                write!(f, "hashtag:{}", name)?;
                if *local {
                    f.write_str(":local")?;
                }
                Ok(())
            }
            FeedId::Account { id, view } => {
                write!(f, "account:{}", id)?;
                match view {
                    AccountView::Statuses => Ok(()),
                    AccountView::WithReplies => f.write_str(":with_replies"),
                    AccountView::Media => f.write_str(":media"),
                    AccountView::Pinned => f.write_str(":pinned"),
                }
            }
            FeedId::Group { id, view } => {
                write!(f, "group:{}", id)?;
                match view {
                    GroupView::All => Ok(()),
                    GroupView::Media => f.write_str(":media"),
                    GroupView::Pinned => f.write_str(":pinned"),
                }
            }
            FeedId::List { id } => write!(f, "list:{}", id),
            FeedId::Direct => f.write_str("direct"),
            FeedId::Bookmarks => f.write_str("bookmarks"),
            FeedId::Notifications => f.write_str("notifications"),
            FeedId::Chat { id } => write!(f, "chat:{}", id),
        }
    }
}

impl FromStr for FeedId {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FeedError::InvalidFeedId(s.to_string());
        let parts: Vec<&str> = s.split(':').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(invalid());
        }

        let id = match parts.as_slice() {
            ["home"] => FeedId::Home,
            ["public"] => FeedId::Public {
                local: false,
                media: false,
            },
            ["public", "local"] => FeedId::Public {
                local: true,
                media: false,
            },
            ["public", "media"] => FeedId::Public {
                local: false,
                media: true,
            },
            ["public", "local", "media"] => FeedId::Public {
                local: true,
                media: true,
            },
            ["public", "remote"] => FeedId::PublicRemote,
            ["remote", instance] => FeedId::Remote {
                instance: instance.to_string(),
                media: false,
            },
            ["remote", instance, "media"] => FeedId::Remote {
                instance: instance.to_string(),
                media: true,
            },
            ["hashtag", name] => FeedId::Hashtag {
                name: name.to_string(),
                local: false,
            },
            ["hashtag", name, "local"] => FeedId::Hashtag {
                name: name.to_string(),
                local: true,
            },
            ["account", id, rest @ ..] => {
                let view = match rest {
                    [] => AccountView::Statuses,
                    ["with_replies"] => AccountView::WithReplies,
                    ["media"] => AccountView::Media,
                    ["pinned"] => AccountView::Pinned,
                    _ => return Err(invalid()),
                };
                FeedId::Account {
                    id: id.to_string(),
                    view,
                }
            }
            ["group", id, rest @ ..] => {
                let view = match rest {
                    [] => GroupView::All,
                    ["media"] => GroupView::Media,
                    ["pinned"] => GroupView::Pinned,
                    _ => return Err(invalid()),
                };
                FeedId::Group {
                    id: id.to_string(),
                    view,
                }
            }
            ["list", id] => FeedId::List { id: id.to_string() },
            ["direct"] => FeedId::Direct,
            ["bookmarks"] => FeedId::Bookmarks,
            ["notifications"] => FeedId::Notifications,
            ["chat", id] => FeedId::Chat { id: id.to_string() },
            _ => return Err(invalid()),
        };

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("home")]
    #[test_case("public")]
    #[test_case("public:local")]
    #[test_case("public:media")]
    #[test_case("public:local:media")]
    #[test_case("public:remote")]
    #[test_case("remote:mastodon.social")]
    #[test_case("remote:mastodon.social:media")]
    #[test_case("hashtag:rust")]
    #[test_case("hashtag:rust:local")]
    #[test_case("account:9x")]
    #[test_case("account:9x:with_replies")]
    #[test_case("account:9x:media")]
    #[test_case("account:9x:pinned")]
    #[test_case("group:42")]
    #[test_case("group:42:media")]
    #[test_case("group:42:pinned")]
    #[test_case("list:7")]
    #[test_case("direct")]
    #[test_case("bookmarks")]
    #[test_case("notifications")]
    #[test_case("chat:abc")]
    fn test_feed_id_string_is_stable(s: &str) {
        let id: FeedId = s.parse().unwrap();
        assert_eq!(id.to_string(), s);
    }

    #[test_case("" ; "empty")]
    #[test_case("homes" ; "unknown kind")]
    #[test_case("public:media:local" ; "qualifiers out of order")]
    #[test_case("account:" ; "empty id")]
    #[test_case("account:1:replies" ; "unknown account view")]
    #[test_case("group:1:pinned:media" ; "too many qualifiers")]
    #[test_case("hashtag::local" ; "empty tag")]
    fn test_feed_id_rejects(s: &str) {
        assert!(matches!(
            s.parse::<FeedId>(),
            Err(FeedError::InvalidFeedId(_))
        ));
    }

    #[test]
    fn test_feed_kind() {
        assert_eq!(FeedId::Home.kind(), FeedKind::Timeline);
        assert_eq!(FeedId::Notifications.kind(), FeedKind::Notifications);
        assert_eq!(
            FeedId::Chat { id: "1".into() }.kind(),
            FeedKind::Chat
        );
    }

    #[test]
    fn test_resource_for_public_local_media() {
        let id: FeedId = "public:local:media".parse().unwrap();
        let res = id.resource();
        assert_eq!(res.path, "/api/v1/timelines/public");
        assert_eq!(
            res.query,
            vec![("local", "true".to_string()), ("only_media", "true".to_string())]
        );
    }

    #[test]
    fn test_resource_for_account_views() {
        let plain: FeedId = "account:5".parse().unwrap();
        assert_eq!(plain.resource().path, "/api/v1/accounts/5/statuses");
        assert_eq!(
            plain.resource().query,
            vec![("exclude_replies", "true".to_string())]
        );

        let replies: FeedId = "account:5:with_replies".parse().unwrap();
        assert!(replies.resource().query.is_empty());

        let pinned: FeedId = "account:5:pinned".parse().unwrap();
        assert_eq!(pinned.resource().query, vec![("pinned", "true".to_string())]);
    }

    #[test]
    fn test_stream_topics() {
        assert_eq!(FeedId::Home.stream_topic(), Some(StreamTopic::new("user")));
        assert_eq!(
            FeedId::Notifications.stream_topic(),
            Some(StreamTopic::new("user:notification"))
        );
        let tag: FeedId = "hashtag:rust:local".parse().unwrap();
        assert_eq!(
            tag.stream_topic(),
            Some(StreamTopic::with_arg("hashtag:local", "rust"))
        );
        let pinned: FeedId = "group:1:pinned".parse().unwrap();
        assert_eq!(pinned.stream_topic(), None);
        let account: FeedId = "account:1".parse().unwrap();
        assert_eq!(account.stream_topic(), None);
    }

    #[test]
    fn test_topic_control_message() {
        let topic = StreamTopic::with_arg("hashtag", "rust");
        let msg = topic.control_message("subscribe");
        assert_eq!(
            msg,
            serde_json::json!({"type": "subscribe", "stream": "hashtag", "tag": "rust"})
        );

        let user = StreamTopic::new("user");
        assert_eq!(
            user.control_message("unsubscribe"),
            serde_json::json!({"type": "unsubscribe", "stream": "user"})
        );
    }

    #[test]
    fn test_topic_from_stream_array() {
        let parts = vec!["list".to_string(), "12".to_string()];
        assert_eq!(
            StreamTopic::from_stream_array(&parts),
            Some(StreamTopic::with_arg("list", "12"))
        );
        assert_eq!(StreamTopic::from_stream_array(&[]), None);
    }
}
