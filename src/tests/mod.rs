// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

mod common;
mod interpreter;
mod lexer;
mod parser;
mod typing;
