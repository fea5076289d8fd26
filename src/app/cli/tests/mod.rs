//! Tests for the command-line interface
