// A carpooling service is run as a mesh of service nodes. Each node hosts a
// handful of local users and an operations provider (login, registration,
// trips). Users talk to the node that hosts them; that node either serves a
// request itself or relays it through its neighbours to the node whose
// provider was named as the receiver.

// Requests are packaged as commands. A command is a plain value: it carries
// its payload, the id of the node that should serve it and, once a node has
// accepted it from a client, the id of that node (the root sender). Only that
// serializable part travels between nodes. Executing a command spawns a task
// per command, so the caller is never blocked while the provider works, and
// the outcome is picked up later through a completion handle.

pub mod dispatch;
pub mod geo;
pub mod hex;
pub mod mesh;
pub mod model;
