//! Test utilities for building packages and functions by hand.
