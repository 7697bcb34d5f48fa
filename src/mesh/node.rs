use std::fmt;

use super::{node_id, NodeID};
use crate::geo::Location;
use crate::model::User;

/// What every participant of the mesh has: a name, an optional geographic
/// name and an optional position.
pub trait Node {
    fn info(&self) -> &NodeInfo;

    fn name(&self) -> &str {
        &self.info().name
    }

    fn geo_name(&self) -> Option<&str> {
        self.info().geo_name.as_deref()
    }

    fn location(&self) -> Option<&Location> {
        self.info().location.as_ref()
    }

    fn id(&self) -> NodeID {
        node_id(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub name: String,
    pub geo_name: Option<String>,
    pub location: Option<Location>,
}

impl NodeInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            geo_name: None,
            location: None,
        }
    }

    pub fn with_geo_name(mut self, geo_name: impl Into<String>) -> Self {
        self.geo_name = Some(geo_name.into());
        self
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(geo_name) = &self.geo_name {
            write!(f, " @ {}", geo_name)?;
        }
        Ok(())
    }
}

/// A client of the service. It is attached to one service node by
/// convention; it does not know which.
#[derive(Debug, Clone, PartialEq)]
pub struct UserNode {
    info: NodeInfo,
    user: Option<User>,
    user_location_name: Option<String>,
}

impl UserNode {
    pub fn new(user_name: impl Into<String>) -> Self {
        Self {
            info: NodeInfo::new(user_name),
            user: None,
            user_location_name: None,
        }
    }

    pub fn located(user_name: impl Into<String>, location: Location) -> Self {
        Self {
            info: NodeInfo::new(user_name).with_location(location),
            ..Self::new("")
        }
    }

    /// A user node for a registered profile, named after its username.
    pub fn for_user(user: User, user_location_name: impl Into<String>) -> Self {
        Self {
            info: NodeInfo::new(user.username.clone()),
            user: Some(user),
            user_location_name: Some(user_location_name.into()),
        }
    }

    pub fn with_location_name(
        user_name: impl Into<String>,
        user_location_name: impl Into<String>,
    ) -> Self {
        Self {
            user_location_name: Some(user_location_name.into()),
            ..Self::new(user_name)
        }
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn set_user(&mut self, user: User) {
        self.user = Some(user);
    }

    /// Where the user says they are, as free text. Unrelated to the
    /// coordinates in [`Node::location`].
    pub fn user_location_name(&self) -> Option<&str> {
        self.user_location_name.as_deref()
    }
}

impl Node for UserNode {
    fn info(&self) -> &NodeInfo {
        &self.info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_node_constructors() {
        let plain = UserNode::new("mario");
        assert_eq!(plain.name(), "mario");
        assert_eq!(plain.id(), node_id("mario"));
        assert!(plain.location().is_none());

        let located = UserNode::located("anna", Location::new(45.46, 9.19));
        assert_eq!(located.name(), "anna");
        assert_eq!(located.location(), Some(&Location::new(45.46, 9.19)));

        let user = User::with_username("Luca Bianchi", "luca");
        let hosted = UserNode::for_user(user.clone(), "Porta Nuova");
        assert_eq!(hosted.name(), "luca");
        assert_eq!(hosted.user(), Some(&user));
        assert_eq!(hosted.user_location_name(), Some("Porta Nuova"));

        let named = UserNode::with_location_name("gino", "Lingotto");
        assert_eq!(named.user_location_name(), Some("Lingotto"));
        assert!(named.user().is_none());
    }

    #[test]
    fn info_display() {
        let info = NodeInfo::new("mi-1").with_geo_name("Milano");
        assert_eq!(info.to_string(), "mi-1 @ Milano");
        assert_eq!(NodeInfo::new("to-1").to_string(), "to-1");
    }
}
