//! Property tests driving a live daemon through the client.
